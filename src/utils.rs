// A simple wrapper around File::open adding details about the
// problematic file.
use crate::Result;
use std::path::Path;
use tch::Device;

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}: {e}", path.as_ref().to_string_lossy());
        std::io::Error::new(e.kind(), context).into()
    })
}

/// The accelerator when there is one and `cpu` is not set.
pub fn device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}
