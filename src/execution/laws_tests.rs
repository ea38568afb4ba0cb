//! Algebraic and counter laws of the execution algebra.

use super::Execution;
use crate::config::{Config, Mode};
use crate::counters::StatKey;
use crate::error::ExecResult;
use crate::flow::FlowDef;
use crate::testing::{mock_mode, test_config, test_executor, MockSubmitter};

async fn run_value<T>(ex: &Execution<T>) -> ExecResult<T>
where
    T: Clone + Send + Sync + 'static,
{
    let (mode, _submitter) = mock_mode();
    ex.run(test_config(), mode, &test_executor())
        .await_result()
        .await
}

async fn assert_same_value<T>(left: &Execution<T>, right: &Execution<T>)
where
    T: Clone + Send + Sync + PartialEq + std::fmt::Debug + 'static,
{
    let a = run_value(left).await.unwrap();
    let b = run_value(right).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn map_identity() {
    let ex = Execution::from(7).map(|n| n * 3);
    assert_same_value(&ex, &ex.map(|n| *n)).await;
}

#[tokio::test]
async fn map_composition() {
    let ex = Execution::from(5);
    let left = ex.map(|n| n + 1).map(|n| n * 2);
    let right = ex.map(|n| (n + 1) * 2);
    assert_same_value(&left, &right).await;
}

#[tokio::test]
async fn flat_map_left_identity() {
    let f = |n: &i64| Execution::from(n * 10);
    let left = Execution::from(4).flat_map(f);
    let right = f(&4);
    assert_same_value(&left, &right).await;
}

#[tokio::test]
async fn flat_map_right_identity() {
    let ex = Execution::from(11).map(|n| n - 1);
    let wrapped = ex.flat_map(|n| Execution::from(*n));
    assert_same_value(&ex, &wrapped).await;
}

#[tokio::test]
async fn flat_map_associativity() {
    let ex = Execution::from(2);
    let f = |n: &i64| Execution::from(n + 10);
    let g = |n: &i64| Execution::from(n * 7);
    let left = ex.flat_map(f).flat_map(g);
    let right = ex.flat_map(move |n| f(n).flat_map(g));
    assert_same_value(&left, &right).await;
}

#[tokio::test]
async fn zip_commutes_up_to_swap() {
    let a = Execution::from("left".to_string());
    let b = Execution::from(9);
    let swapped = a.zip(&b).map(|(x, y)| (*y, x.clone()));
    let direct = b.zip(&a);
    assert_same_value(&swapped, &direct).await;
}

// Flow submissions carry counters, so laws about counter accumulation use
// raw flow defs: each one is its own submission and nothing coalesces.
fn flow_with_counters(name: &'static str) -> Execution<()> {
    Execution::from_fn(move |_, _| Ok(FlowDef::named(name)))
}

#[tokio::test]
async fn zip_counters_are_the_elementwise_sum() {
    let rows = StatKey::new("io", "rows");

    let submitter = MockSubmitter::new().with_counter("io", "rows", 5);
    let a = flow_with_counters("a");
    let b = flow_with_counters("b");
    let (_, counters) = a
        .zip(&b)
        .get_counters()
        .run(test_config(), Mode::local(submitter), &test_executor())
        .await_result()
        .await
        .unwrap();
    assert_eq!(counters.value(&rows), 10);

    let single = MockSubmitter::new().with_counter("io", "rows", 5);
    let (_, alone) = flow_with_counters("a")
        .get_counters()
        .run(test_config(), Mode::local(single), &test_executor())
        .await_result()
        .await
        .unwrap();
    assert_eq!(alone.value(&rows), 5);
}

#[tokio::test]
async fn reset_then_get_counters_is_empty() {
    let submitter = MockSubmitter::new().with_counter("io", "rows", 5);
    let (_, counters) = flow_with_counters("a")
        .reset_counters()
        .get_counters()
        .run(test_config(), Mode::local(submitter), &test_executor())
        .await_result()
        .await
        .unwrap();
    assert!(counters.is_empty());
}

#[tokio::test]
async fn get_counters_preserves_the_value() {
    let ex = Execution::from(41).map(|n| n + 1);
    let projected = ex.get_counters().map(|(value, _)| *value);
    assert_same_value(&ex, &projected).await;
}

#[tokio::test]
async fn counters_keep_accumulating_past_get_counters() {
    let submitter = MockSubmitter::new().with_counter("io", "rows", 5);
    let inner = flow_with_counters("a").get_counters();
    let (_, outer) = inner
        .get_counters()
        .run(test_config(), Mode::local(submitter), &test_executor())
        .await_result()
        .await
        .unwrap();
    assert_eq!(outer.value(&StatKey::new("io", "rows")), 5);
}

#[tokio::test]
async fn pure_executions_have_empty_counters() {
    let ex = Execution::from(1).map(|n| n + 2);
    let (_, counters) = run_value(&ex.get_counters()).await.unwrap();
    assert!(counters.is_empty());
}

// Concrete scenarios.

#[tokio::test]
async fn map_then_flat_map_pipeline() {
    let ex = Execution::from(1)
        .map(|n| n + 2)
        .flat_map(|n| Execution::from(n * 10));
    assert_eq!(run_value(&ex).await.unwrap(), 30);

    // The same graph yields the same value with the optimizer off.
    let (mode, _submitter) = mock_mode();
    let value = ex
        .run(
            test_config().with_optimization(false),
            mode,
            &test_executor(),
        )
        .await_result()
        .await
        .unwrap();
    assert_eq!(value, 30);
}

#[tokio::test]
async fn zip3_sums() {
    let ex = Execution::from(1)
        .zip3(&Execution::from(2), &Execution::from(3))
        .map(|(a, b, c)| a + b + c);
    assert_eq!(run_value(&ex).await.unwrap(), 6);
}

#[tokio::test]
async fn recover_with_handles_a_matching_failure() {
    let ex = Execution::from(())
        .flat_map(|_| Execution::<i64>::failed(anyhow::anyhow!("expected failure")))
        .recover_with(|err| {
            if err.to_string().contains("expected") {
                Some(Execution::from(42))
            } else {
                None
            }
        });
    assert_eq!(run_value(&ex).await.unwrap(), 42);
}

#[tokio::test]
async fn recover_with_propagates_when_undefined() {
    let ex = Execution::<i64>::failed(anyhow::anyhow!("unhandled"))
        .recover_with(|_| None::<Execution<i64>>);
    assert!(run_value(&ex).await.is_err());
}

#[test]
fn wait_for_blocks_to_completion() {
    let ex = Execution::from(6).map(|n| n * 7);
    let (mode, _submitter) = mock_mode();
    assert_eq!(ex.wait_for(Config::empty(), mode).unwrap(), 42);
}
