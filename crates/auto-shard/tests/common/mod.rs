#![allow(dead_code)]

use std::sync::Arc;

use auto_shard::{
    ContextConfig, DeviceTarget, ExecutionError, Function, FunctionRef, HostExecutor, HostTensor, ParallelContext,
    Parameter, ParameterBearing, Shard,
};

/// Element-wise add with a (unused) trainable bias, like a minimal cell.
pub struct Add {
    pub bias: Parameter,
}

impl Function<HostTensor> for Add {
    fn name(&self) -> &str {
        "add"
    }

    fn call(&self, args: &[HostTensor]) -> Result<Vec<HostTensor>, ExecutionError> {
        Ok(vec![&args[0] + &args[1]])
    }

    fn as_parameter_bearing(&self) -> Option<&dyn ParameterBearing> {
        Some(self)
    }
}

impl ParameterBearing for Add {
    fn trainable_parameters(&self) -> Vec<Parameter> {
        vec![self.bias.clone()]
    }
}

pub fn add_cell() -> (FunctionRef<HostTensor>, Parameter) {
    let bias = Parameter::new("bias", vec![32, 10]);
    (Arc::new(Add { bias: bias.clone() }), bias)
}

pub fn context(device_num: usize) -> Arc<ParallelContext> {
    Arc::new(ParallelContext::new(ContextConfig::sharding_propagation(
        DeviceTarget::Ascend,
        device_num,
    )))
}

pub struct Fixture {
    pub context: Arc<ParallelContext>,
    pub executor: Arc<HostExecutor>,
    pub site: Shard<HostExecutor>,
}

pub fn fixture(device_num: usize) -> Fixture {
    let context = context(device_num);
    let executor = Arc::new(HostExecutor::new(context.clone()));
    let site = Shard::new(context.clone(), executor.clone());
    Fixture {
        context,
        executor,
        site,
    }
}

pub fn ones() -> HostTensor {
    HostTensor::ones(vec![32, 10])
}
