//! Deployments
//!
//! A deployment binds each instance of a [`Deployable`] to a freshly created
//! context for the instance's whole lifetime. `start` and `stop` run as
//! tasks of that context. If any instance fails to start, the instances
//! that did start are stopped and every context of the deployment is
//! closed before the failure is reported.

use crate::context::{Context, ContextKind, DrainPolicy};
use crate::error::{BoxError, RuntimeError, RuntimeResult, TaskFailure};
use crate::scheduler::Shared;
use crate::AsyncResult;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A unit of work deployed on its own context
pub trait Deployable: Send + 'static {
    /// Called on the instance's context when it is deployed
    fn start(&mut self, context: &Context) -> Result<(), BoxError>;

    /// Called on the instance's context when it is undeployed
    fn stop(&mut self, _context: &Context) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Unique identifier for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeploymentId(u64);

impl DeploymentId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        DeploymentId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deployment-{}", self.0)
    }
}

/// How a deployment is laid out on contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentOptions {
    /// Context kind of every instance
    pub kind: ContextKind,
    /// Number of instances, one context each
    pub instances: usize,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            kind: ContextKind::EventLoop,
            instances: 1,
        }
    }
}

impl DeploymentOptions {
    /// Worker deployment with one instance
    pub fn worker() -> Self {
        Self {
            kind: ContextKind::Worker,
            ..Default::default()
        }
    }

    /// Same options with `instances` instances
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    fn validate(&self) -> RuntimeResult<()> {
        if self.instances == 0 {
            return Err(RuntimeError::InvalidConfig(
                "deployment needs at least one instance".to_string(),
            ));
        }
        Ok(())
    }
}

type Unit = Arc<Mutex<Box<dyn Deployable>>>;

/// One deployed instance and its context
struct Instance {
    context: Context,
    unit: Unit,
    started: AtomicBool,
}

impl Instance {
    /// Run the stop hook as the last task of the context, then close it
    fn teardown(self: &Arc<Self>, policy: DrainPolicy, failure: &Arc<Mutex<Option<TaskFailure>>>) {
        let stop_task = if self.started.load(Ordering::Acquire) {
            let instance = self.clone();
            let failure = failure.clone();
            let task: crate::executor::Task = Box::new(move || {
                let context = instance.context.clone();
                let result = panic::catch_unwind(AssertUnwindSafe(|| instance.unit.lock().stop(&context)));
                let outcome = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(TaskFailure::from(err)),
                    Err(payload) => Some(TaskFailure::from_panic(payload)),
                };
                if let Some(err) = outcome {
                    tracing::warn!(context = %context.id(), error = %err, "instance failed to stop");
                    failure.lock().get_or_insert(err);
                }
            });
            Some(task)
        } else {
            None
        };

        self.context.close_with(policy, stop_task);
    }
}

struct Deployment {
    options: DeploymentOptions,
    instances: Vec<Arc<Instance>>,
}

type Completion<T> = Box<dyn FnOnce(AsyncResult<T>) + Send + 'static>;

/// Close every instance, then deliver the outcome on `caller`
fn teardown_all<T: Send + 'static>(
    instances: &[Arc<Instance>],
    policy: DrainPolicy,
    caller: Context,
    on_done: impl FnOnce(Option<TaskFailure>) -> AsyncResult<T> + Send + 'static,
    on_complete: Completion<T>,
) {
    let failure = Arc::new(Mutex::new(None));
    let remaining = Arc::new(AtomicUsize::new(instances.len()));
    let finish = Arc::new(Mutex::new(Some((on_done, on_complete))));

    for instance in instances {
        let failure_slot = failure.clone();
        let remaining = remaining.clone();
        let finish = finish.clone();
        let caller = caller.clone();

        instance.teardown(policy, &failure);
        instance.context.on_closed(move || {
            if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }
            let pending = finish.lock().take();
            if let Some((on_done, on_complete)) = pending {
                let outcome = on_done(failure_slot.lock().take());
                if let Err(err) = caller.deliver_result(on_complete, outcome) {
                    tracing::warn!(context = %caller.id(), error = %err, "deployment completion dropped");
                }
            }
        });
    }
}

/// Table of live deployments of one runtime
pub(crate) struct DeploymentManager {
    deployments: Arc<DashMap<DeploymentId, Deployment>>,
}

impl DeploymentManager {
    pub fn new() -> Self {
        Self {
            deployments: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.deployments.len()
    }

    pub fn ids(&self) -> Vec<DeploymentId> {
        self.deployments.iter().map(|entry| *entry.key()).collect()
    }

    /// Create one context per instance and start every instance on it
    pub fn deploy<D, F, H>(
        &self,
        shared: &Arc<Shared>,
        caller: Context,
        factory: F,
        options: DeploymentOptions,
        on_complete: H,
    ) -> RuntimeResult<()>
    where
        D: Deployable,
        F: Fn() -> D,
        H: FnOnce(AsyncResult<DeploymentId>) + Send + 'static,
    {
        options.validate()?;
        let id = DeploymentId::next();

        let instances: Vec<Arc<Instance>> = (0..options.instances)
            .map(|_| {
                Arc::new(Instance {
                    context: shared.create_context(options.kind),
                    unit: Arc::new(Mutex::new(Box::new(factory()) as Box<dyn Deployable>)),
                    started: AtomicBool::new(false),
                })
            })
            .collect();

        tracing::debug!(deployment = %id, kind = %options.kind, instances = options.instances, "deploying");

        let on_complete: Completion<DeploymentId> = Box::new(on_complete);
        let progress = Arc::new(StartProgress {
            id,
            options,
            instances: instances.clone(),
            remaining: AtomicUsize::new(instances.len()),
            failure: Mutex::new(None),
            caller,
            on_complete: Mutex::new(Some(on_complete)),
            table: self.deployments.clone(),
        });

        for instance in &instances {
            let task_instance = instance.clone();
            let task_progress = progress.clone();
            let posted = instance.context.run_on_context(move || {
                let context = task_instance.context.clone();
                let result = panic::catch_unwind(AssertUnwindSafe(|| task_instance.unit.lock().start(&context)));
                match result {
                    Ok(Ok(())) => task_instance.started.store(true, Ordering::Release),
                    Ok(Err(err)) => task_progress.fail(TaskFailure::from(err)),
                    Err(payload) => task_progress.fail(TaskFailure::from_panic(payload)),
                }
                task_progress.instance_done();
            });

            if let Err(err) = posted {
                // Nothing has run yet on the contexts that did accept the start task
                for instance in &instances {
                    instance.context.close(DrainPolicy::ForceStop);
                }
                return Err(err);
            }
        }

        Ok(())
    }

    /// Remove a deployment and tear its instances down
    pub fn undeploy<H>(&self, id: DeploymentId, policy: DrainPolicy, caller: Context, on_complete: H) -> RuntimeResult<()>
    where
        H: FnOnce(AsyncResult<()>) + Send + 'static,
    {
        let (_, deployment) = self
            .deployments
            .remove(&id)
            .ok_or(RuntimeError::UnknownDeployment(id))?;

        tracing::debug!(deployment = %id, ?policy, instances = deployment.instances.len(), "undeploying");

        teardown_all(
            &deployment.instances,
            policy,
            caller,
            |failure| match failure {
                Some(failure) => Err(failure),
                None => Ok(()),
            },
            Box::new(on_complete),
        );
        Ok(())
    }

    /// Tear down every deployment without completion handlers (runtime shutdown)
    pub fn undeploy_all(&self, policy: DrainPolicy) {
        let ids = self.ids();
        for id in ids {
            if let Some((_, deployment)) = self.deployments.remove(&id) {
                let failure = Arc::new(Mutex::new(None));
                for instance in &deployment.instances {
                    instance.teardown(policy, &failure);
                }
                tracing::debug!(deployment = %id, kind = %deployment.options.kind, "undeployed on shutdown");
            }
        }
    }
}

/// Shared state of a deployment whose instances are starting
struct StartProgress {
    id: DeploymentId,
    options: DeploymentOptions,
    instances: Vec<Arc<Instance>>,
    remaining: AtomicUsize,
    /// First start failure
    failure: Mutex<Option<TaskFailure>>,
    caller: Context,
    on_complete: Mutex<Option<Completion<DeploymentId>>>,
    table: Arc<DashMap<DeploymentId, Deployment>>,
}

impl StartProgress {
    fn fail(&self, failure: TaskFailure) {
        tracing::warn!(deployment = %self.id, error = %failure, "instance failed to start");
        self.failure.lock().get_or_insert(failure);
    }

    /// Called once per instance; the last one decides the outcome
    fn instance_done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let Some(on_complete) = self.on_complete.lock().take() else {
            return;
        };

        let failure = self.failure.lock().take();
        match failure {
            None => {
                self.table.insert(
                    self.id,
                    Deployment {
                        options: self.options,
                        instances: self.instances.clone(),
                    },
                );
                tracing::debug!(deployment = %self.id, "deployed");
                if let Err(err) = self.caller.deliver_result(on_complete, Ok(self.id)) {
                    tracing::warn!(context = %self.caller.id(), error = %err, "deployment completion dropped");
                }
            }
            Some(failure) => {
                tracing::debug!(deployment = %self.id, "rolling back");
                teardown_all(
                    &self.instances,
                    DrainPolicy::Drain,
                    self.caller.clone(),
                    move |_| Err(failure),
                    on_complete,
                );
            }
        }
    }
}
