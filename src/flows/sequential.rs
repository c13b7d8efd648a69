//! Composition of flows.
//!
//! The log-determinant of a composition is the sum of the log-determinants
//! of its parts. It is threaded through the chain as a plain value.
use super::Flow;
use crate::Result;
use tch::{Kind, Tensor};

/// Which pass to run through a chain of flows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pass {
    Forward,
    /// Data-dependent initialization with the given scale.
    Init(f64),
}

impl Pass {
    pub fn apply(
        self,
        flow: &dyn Flow,
        xs: &Tensor,
        cond: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            Pass::Forward => flow.forward(xs, cond),
            Pass::Init(init_scale) => flow.init(xs, cond, init_scale),
        }
    }
}

pub(crate) fn zero_logdet(xs: &Tensor) -> Tensor {
    Tensor::zeros([xs.size()[0]], (Kind::Float, xs.device()))
}

/// A sequence of flows applied in order, and inverted in reverse order.
#[derive(Debug, Default)]
pub struct FlowSequence {
    flows: Vec<Box<dyn Flow>>,
}

impl FlowSequence {
    pub fn new() -> Self {
        Self { flows: vec![] }
    }

    pub fn add<F: Flow + 'static>(mut self, flow: F) -> Self {
        self.flows.push(Box::new(flow));
        self
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn run(&self, pass: Pass, xs: &Tensor, cond: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.flows.iter().try_fold((xs.shallow_clone(), zero_logdet(xs)), |(xs, logdet), flow| {
            let (ys, flow_logdet) = pass.apply(flow.as_ref(), &xs, cond)?;
            Ok((ys, logdet + flow_logdet))
        })
    }
}

impl Flow for FlowSequence {
    fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.run(Pass::Forward, xs, cond)
    }

    fn inverse(&self, ys: &Tensor, cond: Option<&Tensor>) -> Result<Tensor> {
        self.flows.iter().rev().try_fold(ys.shallow_clone(), |ys, flow| flow.inverse(&ys, cond))
    }

    fn init(
        &self,
        xs: &Tensor,
        cond: Option<&Tensor>,
        init_scale: f64,
    ) -> Result<(Tensor, Tensor)> {
        self.run(Pass::Init(init_scale), xs, cond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{actnorm::ActNorm2d, conv1x1::InvConv1x1, testing};
    use tch::{nn, Device};

    #[test]
    fn logdets_add_up() {
        tch::manual_seed(12);
        let vs = nn::VarStore::new(Device::Cpu);
        let actnorm = ActNorm2d::new(&vs.root() / "actnorm", (3, 2, 2));
        let conv = InvConv1x1::new(&vs.root() / "conv", (3, 2, 2));
        testing::perturb(&vs, 0.3);
        let xs = Tensor::randn([2, 3, 2, 2], (Kind::Float, Device::Cpu));
        let (ys, l1) = actnorm.forward(&xs, None).unwrap();
        let (_, l2) = conv.forward(&ys, None).unwrap();
        let seq = FlowSequence::new().add(actnorm).add(conv);
        assert_eq!(seq.len(), 2);
        let (_, logdet) = seq.forward(&xs, None).unwrap();
        assert!(logdet.allclose(&(l1 + l2), 1e-5, 1e-5, false));
        testing::assert_round_trip(&seq, &xs, None);
        testing::assert_logdet_matches_jacobian(&seq, &xs.narrow(0, 0, 1), None);
    }
}
