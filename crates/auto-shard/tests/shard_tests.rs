mod common;

use std::sync::Arc;

use auto_shard::*;
use common::{add_cell, fixture, ones};
use pretty_assertions::assert_eq;
use rstest::rstest;

#[test]
fn test_shard_adds_sharded_inputs() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();

    let sharded = fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
    let outputs = sharded.call(&[ones(), ones()]).unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].shape(), &[32, 10]);
    assert_eq!(outputs[0], HostTensor::from_elem(vec![32, 10], 2.0));
    assert_eq!(fixture.executor.compilations(), 1);
}

#[test]
fn test_free_function_shard() {
    let context = common::context(2);
    let executor = Arc::new(HostExecutor::new(context.clone()));
    let add = from_fn("add", |args: &[HostTensor]| Ok(vec![&args[0] + &args[1]]));

    let sharded = shard(context, executor, &add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();

    assert_eq!(sharded.call(&[ones(), ones()]).unwrap()[0].sum(), 640.0);
}

#[test]
fn test_same_strategy_reuses_closure() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();
    let args = || {
        ShardArgs::new(((2, 1), (2, 1)))
            .parameter_plan(Value::dict([("a", (2, 1)), ("b", (1, 2))]))
    };
    let swapped = ShardArgs::new(((2, 1), (2, 1))).parameter_plan(Value::dict([("b", (1, 2)), ("a", (2, 1))]));

    let first = fixture.site.apply(&add, args()).unwrap();
    let second = fixture.site.apply(&add, args()).unwrap();
    let third = fixture.site.apply(&add, swapped).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(fixture.site.compilations(), 1);
}

#[test]
fn test_list_and_tuple_strategies_are_equal() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();

    let first = fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
    let second = fixture
        .site
        .apply(&add, ShardArgs::new(vec![Value::from((2, 1)), Value::from(vec![2, 1])]))
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_changed_strategy_rebinds() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();

    let first = fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
    let second = fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1))).level(1)).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(fixture.site.compilations(), 2);
    assert_eq!(
        fixture.site.strategy(),
        Some(
            &StrategyDescriptor::new(vec![
                Some(Layout::new([2, 1]).unwrap()),
                Some(Layout::new([2, 1]).unwrap())
            ])
            .with_level(StrategyLevel::MaximizeSpeed)
        )
    );

    // The old strategy is not remembered.
    let third = fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(fixture.site.compilations(), 3);
}

#[test]
fn test_changed_function_rebinds() {
    let mut fixture = fixture(8);
    let (first_add, _) = add_cell();
    let (second_add, _) = add_cell();

    let first = fixture.site.apply(&first_add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
    let second = fixture.site.apply(&second_add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(second.function(), &second_add));
    assert_eq!(fixture.site.graphs().len(), 2);
}

#[test]
fn test_sites_share_graph_functions() {
    let context = common::context(8);
    let executor = Arc::new(HostExecutor::new(context.clone()));
    let graphs = Arc::new(GraphFunctionCache::new(executor.clone()));
    let mut first_site = Shard::with_graph_cache(context.clone(), graphs.clone());
    let mut second_site = Shard::with_graph_cache(context, graphs.clone());
    let (add, _) = add_cell();

    let first = first_site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
    let second = second_site.apply(&add, ShardArgs::new(((4, 1), (4, 1)))).unwrap();
    first.call(&[ones(), ones()]).unwrap();
    second.call(&[ones(), ones()]).unwrap();

    assert_eq!(graphs.len(), 1);
    assert_eq!(graphs.get_or_create(&add).calls(), 2);
    assert_eq!(executor.compilations(), 2);
}

#[test]
fn test_repeated_calls_reuse_specialization() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();
    let sharded = fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();

    for _ in 0..3 {
        sharded.call(&[ones(), ones()]).unwrap();
    }
    sharded
        .call(&[HostTensor::ones(vec![64, 10]), HostTensor::ones(vec![64, 10])])
        .unwrap();

    assert_eq!(fixture.executor.compilations(), 2);
}

#[test]
fn test_parameters_are_marked_in_shard() {
    let mut fixture = fixture(8);
    let (add, bias) = add_cell();
    assert!(!bias.is_in_shard());

    fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();

    assert!(bias.is_in_shard());
}

#[test]
fn test_global_flags_are_overridden() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();
    assert!(fixture.context.fully_use_devices());
    assert!(!fixture.context.full_batch_is_set());

    fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();

    assert!(!fixture.context.fully_use_devices());
    assert_eq!(fixture.context.dataset_strategy(), Some(DatasetStrategy::FullBatch));
}

#[test]
fn test_explicit_dataset_strategy_is_kept() {
    let mut fixture = fixture(8);
    fixture.context.set_dataset_strategy(DatasetStrategy::DataParallel);
    let (add, _) = add_cell();

    fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();

    assert_eq!(fixture.context.dataset_strategy(), Some(DatasetStrategy::DataParallel));
}

#[test]
fn test_out_strategy_is_reported_regardless_of_device() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();

    let valid_device = fixture
        .site
        .apply(&add, ShardArgs::new(vec![(2, 1)]).out_strategy(5))
        .unwrap_err();
    let invalid_device = fixture
        .site
        .apply(&add, ShardArgs::new(vec![(2, 1)]).out_strategy(5).device(7))
        .unwrap_err();

    assert!(valid_device.mentions_argument("out_strategy"));
    assert!(!valid_device.mentions_argument("device"));
    assert!(invalid_device.mentions_argument("out_strategy"));
    assert!(invalid_device.mentions_argument("device"));
    assert!(valid_device.to_string().contains("'out_strategy'"));
}

#[test]
fn test_invalid_arguments_do_not_mutate() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();

    let error = fixture.site.apply(&add, ShardArgs::new(5)).unwrap_err();

    assert!(error.mentions_argument("in_strategy"));
    assert!(fixture.site.strategy().is_none());
    assert!(fixture.context.fully_use_devices());
    assert!(!fixture.context.full_batch_is_set());
}

#[rstest]
#[case::graph_mode(
    |config: &mut ContextConfig| config.mode = ExecutionMode::Graph,
    ConfigurationError::ExecutionMode { mode: ExecutionMode::Graph }
)]
#[case::semi_auto_parallel(
    |config: &mut ContextConfig| config.parallel_mode = ParallelMode::SemiAutoParallel,
    ConfigurationError::ParallelMode { mode: ParallelMode::SemiAutoParallel }
)]
#[case::dynamic_programming(
    |config: &mut ContextConfig| config.search_mode = SearchMode::DynamicProgramming,
    ConfigurationError::SearchMode { mode: SearchMode::DynamicProgramming }
)]
#[case::cpu_target(
    |config: &mut ContextConfig| config.device_target = DeviceTarget::Cpu,
    ConfigurationError::DeviceTarget { device: DeviceTarget::Cpu }
)]
fn test_configuration_errors_keep_binding(
    #[case] misconfigure: fn(&mut ContextConfig),
    #[case] expected: ConfigurationError,
) {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();
    let cached = fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
    let strategy = fixture.site.strategy().cloned();
    fixture.context.update(|config| {
        config.fully_use_devices = true;
        config.dataset_strategy = None;
    });
    fixture.context.update(misconfigure);

    let error = fixture.site.apply(&add, ShardArgs::new(((4, 1), (4, 1))).level(2)).unwrap_err();

    assert_eq!(error, ShardError::Configuration(expected));
    assert!(error.is_configuration());
    assert_eq!(fixture.site.strategy().cloned(), strategy);
    assert!(Arc::ptr_eq(fixture.site.shard_fn().unwrap(), &cached));
    assert!(fixture.context.fully_use_devices());
    assert!(!fixture.context.full_batch_is_set());
    assert_eq!(cached.call(&[ones(), ones()]).unwrap()[0].sum(), 640.0);
}

#[test]
fn test_configuration_is_checked_before_arguments() {
    let mut fixture = fixture(8);
    fixture.context.update(|config| config.mode = ExecutionMode::Graph);
    let (add, _) = add_cell();

    let error = fixture.site.apply(&add, ShardArgs::new(5)).unwrap_err();

    assert!(error.is_configuration());
}

#[test]
fn test_gpu_context_is_supported() {
    let mut fixture = fixture(2);
    fixture.context.update(|config| config.device_target = DeviceTarget::Gpu);
    let (add, _) = add_cell();

    let sharded = fixture
        .site
        .apply(&add, ShardArgs::new(((2, 1), (2, 1))).device("GPU"))
        .unwrap();

    assert_eq!(sharded.strategy().device, DeviceTarget::Gpu);
}

#[test]
fn test_execution_errors_reach_caller() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();

    let sharded = fixture.site.apply(&add, ShardArgs::new(((3, 1), (2, 1)))).unwrap();
    let error = sharded.call(&[ones(), ones()]).unwrap_err();

    assert_eq!(
        error,
        ExecutionError::Mesh(sharding::MeshError::IndivisibleDevices {
            required: 3,
            available: 8
        })
    );
    assert_eq!(fixture.executor.compilations(), 0);
}

#[test]
fn test_overflowing_layout_is_an_error() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();

    let sharded = fixture
        .site
        .apply(&add, ShardArgs::new(((i64::MAX, 4), (2, 1))))
        .unwrap();
    let error = sharded.call(&[ones(), ones()]).unwrap_err();

    assert!(matches!(
        error,
        ExecutionError::Mesh(sharding::MeshError::ShardCountOverflow { available: 8, .. })
    ));
}

#[test]
fn test_shard_fn_debug_names_function() {
    let mut fixture = fixture(8);
    let (add, _) = add_cell();

    let sharded = fixture.site.apply(&add, ShardArgs::new(((2, 1), (2, 1)))).unwrap();
    let debug = format!("{sharded:?}");

    assert!(debug.starts_with("ShardFn"));
    assert!(debug.contains("\"add\""));
}

#[test]
fn test_obtain_bypasses_validation() {
    let mut fixture = fixture(8);
    fixture.context.update(|config| config.mode = ExecutionMode::Graph);
    let (add, _) = add_cell();
    let strategy = StrategyDescriptor::new(vec![None, None]);

    let first = fixture.site.obtain(&add, strategy.clone());
    let second = fixture.site.obtain(&add, strategy);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fixture.site.compilations(), 1);
    assert!(fixture.context.fully_use_devices());
}
