//! Ordered shutdown of long-running services.
//!
//! Services are registered in dependency order (producers first). On shutdown they are stopped in
//! reverse registration order: each one gets its own cancellation token fired, and the coordinator
//! waits up to the grace period for it to finish before moving on to the next. This keeps
//! consumers from reading a feed whose producer has already gone away.
//!
//! A service that returns or panics before its token fires brings the whole process down the
//! same way a signal does.

use std::{fmt, future::Future, panic::AssertUnwindSafe, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use thiserror::Error;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error type for shutdown operations.
#[derive(Debug, Error)]
pub enum ShutdownErr {
    /// A service did not stop within the grace period and was aborted.
    #[error("timeout stopping {0}")]
    ShutdownTimeout(String),

    /// A service task panicked.
    #[error("{0} panicked")]
    Panicked(String),
}

enum Stage {
    Task(JoinHandle<()>),
    Cleanup(BoxFuture<'static, ()>),
}

struct Service {
    name: String,
    token: CancellationToken,
    stage: Stage,
}

/// Owns every long-running task of the process and stops them in reverse order.
pub struct ShutdownCoordinator {
    requested: CancellationToken,
    services: Vec<Service>,
    grace: Duration,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field(
                "services",
                &self.services.iter().map(|s| &s.name).collect::<Vec<_>>(),
            )
            .field("grace", &self.grace)
            .finish()
    }
}

impl ShutdownCoordinator {
    /// Creates a coordinator that gives every service `grace` to stop.
    pub fn new(grace: Duration) -> Self {
        Self {
            requested: CancellationToken::new(),
            services: Vec::new(),
            grace,
        }
    }

    /// Spawns a service task. The closure receives the token that will be cancelled when it is
    /// this service's turn to stop.
    ///
    /// If the task ends before that, shutdown is requested.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let service = f(token.clone());

        let requested = self.requested.clone();
        let stopped = token.clone();
        let service_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(service).catch_unwind().await;

            if !stopped.is_cancelled() {
                error!(service = %service_name, panicked = result.is_err(), "service exited unexpectedly, requesting shutdown");
                requested.cancel();
            }
            if let Err(panic) = result {
                std::panic::resume_unwind(panic);
            }
        });

        info!(service = %name, "service started");
        self.services.push(Service {
            name,
            token,
            stage: Stage::Task(handle),
        });
    }

    /// Registers a cleanup future run at this position of the shutdown sequence.
    pub fn register_cleanup<Fut>(&mut self, name: impl Into<String>, cleanup: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.services.push(Service {
            name: name.into(),
            token: CancellationToken::new(),
            stage: Stage::Cleanup(Box::pin(cleanup)),
        });
    }

    /// Number of registered services and cleanups.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Waits for SIGINT, SIGTERM or a service exiting on its own.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!(%e, "could not install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(%e, "could not listen for ctrl-c");
                }
                info!("received interrupt signal");
            }
            _ = terminate => info!("received terminate signal"),
            _ = self.requested.cancelled() => info!("shutdown requested internally"),
        }
    }

    /// Stops every service in reverse registration order.
    ///
    /// All services are stopped even if some of them misbehave; the first error is returned.
    pub async fn shutdown(self) -> Result<(), ShutdownErr> {
        self.requested.cancel();
        let grace = self.grace;
        let mut first_err = None;

        for Service { name, token, stage } in self.services.into_iter().rev() {
            info!(service = %name, "stopping service");
            token.cancel();

            let result = match stage {
                Stage::Task(handle) => {
                    let abort = handle.abort_handle();
                    match timeout(grace, handle).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) if e.is_panic() => Err(ShutdownErr::Panicked(name.clone())),
                        Ok(Err(_)) => Ok(()),
                        Err(_) => {
                            abort.abort();
                            Err(ShutdownErr::ShutdownTimeout(name.clone()))
                        }
                    }
                }
                Stage::Cleanup(cleanup) => timeout(grace, cleanup)
                    .await
                    .map_err(|_| ShutdownErr::ShutdownTimeout(name.clone())),
            };

            match result {
                Ok(()) => info!(service = %name, "service stopped"),
                Err(e) => {
                    error!(service = %name, %e, "service did not stop cleanly");
                    first_err.get_or_insert(e);
                }
            }
        }

        info!("shutdown complete");
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn services_stop_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

        let log = order.clone();
        coordinator.register_cleanup("producer", async move {
            log.lock().unwrap().push("producer");
        });

        for name in ["consumer", "control"] {
            let log = order.clone();
            coordinator.spawn(name, move |token| async move {
                token.cancelled().await;
                log.lock().unwrap().push(name);
            });
        }

        coordinator.shutdown().await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["control", "consumer", "producer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_service_is_aborted_after_grace() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.spawn("stubborn", |_token| async {
            std::future::pending::<()>().await;
        });

        let started = tokio::time::Instant::now();
        let result = coordinator.shutdown().await;

        assert!(matches!(result, Err(ShutdownErr::ShutdownTimeout(name)) if name == "stubborn"));
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn early_exit_requests_shutdown() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.spawn("steady", |token| async move { token.cancelled().await });
        coordinator.spawn("ingest", |_token| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        tokio::time::timeout(Duration::from_secs(10), coordinator.wait_for_signal())
            .await
            .expect("wait_for_signal must return once a service exits");
        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panic_requests_shutdown() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.spawn("worker", |_token| async {
            panic!("zero interval");
        });

        tokio::time::timeout(Duration::from_secs(10), coordinator.wait_for_signal())
            .await
            .expect("wait_for_signal must return once a service panics");

        let result = coordinator.shutdown().await;
        assert!(matches!(result, Err(ShutdownErr::Panicked(name)) if name == "worker"));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_services_do_not_request_shutdown() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.spawn("worker", |token| async move { token.cancelled().await });

        let waited =
            tokio::time::timeout(Duration::from_secs(10), coordinator.wait_for_signal()).await;
        assert!(waited.is_err());
    }
}
