//! User worker modules
//!
//! A [`WorkerModule`] supplies the per-worker state and the methods a
//! pool's tasks can address. The pool stores modules type-erased so it
//! never needs to know the concrete state type; users implement the typed
//! trait and the adapter handles the rest.

use std::any::Any;

use async_trait::async_trait;
use serde_json::Value;

use crate::job::Task;

/// A user-supplied worker implementation.
///
/// `init` runs once per worker and produces the state that every
/// subsequent task on that worker receives mutably. Task errors are not
/// caught: a failing task takes its worker down, which is exactly the
/// signal the pool's failure handling keys off.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use foreman::WorkerModule;
/// use serde_json::{json, Value};
///
/// struct Counter;
///
/// #[async_trait]
/// impl WorkerModule for Counter {
///     type State = i64;
///
///     async fn init(&self, _args: &Value) -> anyhow::Result<i64> {
///         Ok(0)
///     }
///
///     async fn call(&self, method: &str, args: &[Value], state: &mut i64) -> anyhow::Result<Value> {
///         match method {
///             "add" => {
///                 *state += args[0].as_i64().unwrap_or(0);
///                 Ok(json!(*state))
///             }
///             other => anyhow::bail!("unknown method: {other}"),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait WorkerModule: Send + Sync + 'static {
    /// Long-lived per-worker state.
    type State: Send + 'static;

    /// Build the worker state. A failure here is retried by the pool
    /// after its configured delay.
    async fn init(&self, args: &Value) -> anyhow::Result<Self::State>;

    /// Entry point for the nullary task shape. Defaults to dispatching
    /// the method named `run`.
    async fn run(&self, state: &mut Self::State) -> anyhow::Result<Value> {
        self.call("run", &[], state).await
    }

    /// Dispatch a named method.
    async fn call(
        &self,
        method: &str,
        args: &[Value],
        state: &mut Self::State,
    ) -> anyhow::Result<Value>;
}

/// Worker state with the concrete type erased.
pub(crate) type WorkerState = Box<dyn Any + Send>;

/// Object-safe view over a [`WorkerModule`].
#[async_trait]
pub(crate) trait ErasedWorkerModule: Send + Sync {
    async fn boot(&self, args: &Value) -> anyhow::Result<WorkerState>;

    async fn dispatch(&self, task: &Task, state: &mut WorkerState) -> anyhow::Result<Value>;
}

/// Adapter implementing [`ErasedWorkerModule`] for any [`WorkerModule`].
pub(crate) struct ModuleAdapter<M: WorkerModule> {
    module: M,
}

impl<M: WorkerModule> ModuleAdapter<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }
}

#[async_trait]
impl<M: WorkerModule> ErasedWorkerModule for ModuleAdapter<M> {
    async fn boot(&self, args: &Value) -> anyhow::Result<WorkerState> {
        let state = self.module.init(args).await?;
        Ok(Box::new(state))
    }

    async fn dispatch(&self, task: &Task, state: &mut WorkerState) -> anyhow::Result<Value> {
        let state = state
            .downcast_mut::<M::State>()
            .ok_or_else(|| anyhow::anyhow!("worker state type mismatch"))?;
        match task {
            Task::Run => self.module.run(state).await,
            Task::Method(method) => self.module.call(method, &[], state).await,
            Task::Apply { method, args } => self.module.call(method, args, state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Adder;

    #[async_trait]
    impl WorkerModule for Adder {
        type State = i64;

        async fn init(&self, args: &Value) -> anyhow::Result<i64> {
            Ok(args.as_i64().unwrap_or(0))
        }

        async fn call(
            &self,
            method: &str,
            args: &[Value],
            state: &mut i64,
        ) -> anyhow::Result<Value> {
            match method {
                "run" => {
                    *state += 1;
                    Ok(json!(*state))
                }
                "add" => {
                    *state += args[0].as_i64().unwrap_or(0);
                    Ok(json!(*state))
                }
                other => anyhow::bail!("unknown method: {other}"),
            }
        }
    }

    #[tokio::test]
    async fn boot_builds_state_from_init_args() {
        let module = ModuleAdapter::new(Adder);
        let mut state = module.boot(&json!(10)).await.unwrap();

        let result = module.dispatch(&Task::Run, &mut state).await.unwrap();
        assert_eq!(result, json!(11));
    }

    #[tokio::test]
    async fn dispatch_covers_all_task_shapes() {
        let module = ModuleAdapter::new(Adder);
        let mut state = module.boot(&json!(0)).await.unwrap();

        assert_eq!(
            module.dispatch(&Task::Run, &mut state).await.unwrap(),
            json!(1)
        );
        assert_eq!(
            module
                .dispatch(&Task::method("run"), &mut state)
                .await
                .unwrap(),
            json!(2)
        );
        assert_eq!(
            module
                .dispatch(&Task::apply("add", vec![json!(5)]), &mut state)
                .await
                .unwrap(),
            json!(7)
        );
    }

    #[tokio::test]
    async fn unknown_method_propagates_the_error() {
        let module = ModuleAdapter::new(Adder);
        let mut state = module.boot(&json!(0)).await.unwrap();

        let err = module
            .dispatch(&Task::method("bogus"), &mut state)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown method"));
    }

    #[tokio::test]
    async fn state_carries_across_dispatches() {
        let module = ModuleAdapter::new(Adder);
        let mut state = module.boot(&json!(100)).await.unwrap();

        for _ in 0..3 {
            module.dispatch(&Task::Run, &mut state).await.unwrap();
        }
        let result = module
            .dispatch(&Task::apply("add", vec![json!(0)]), &mut state)
            .await
            .unwrap();
        assert_eq!(result, json!(103));
    }
}
