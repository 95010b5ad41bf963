//! Single-worker hypervisor execution context.
//!
//! The hypervisor is constructed on a dedicated thread and never leaves
//! it. Callers submit closures that run there one at a time, in order. The
//! thread also drives a current-thread tokio runtime so that background
//! tasks touching the VM (the idle monitor) share the same context.

use super::Hypervisor;
use crate::error::{Error, Result};
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&mut dyn Hypervisor) + Send + 'static>;

/// Serialized access to a [`Hypervisor`].
///
/// Dropping the queue closes it, waits for queued jobs and drops the
/// hypervisor on the worker.
pub struct VmQueue {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    runtime: Handle,
    worker: Option<thread::JoinHandle<()>>,
}

impl VmQueue {
    /// Start the worker and build the hypervisor on it with `factory`.
    ///
    /// Returns the factory's error if construction fails.
    pub fn spawn<F>(factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn Hypervisor>> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let worker = thread::Builder::new()
            .name("vm-queue".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Io(e)));
                        return;
                    }
                };

                let mut hypervisor = match factory() {
                    Ok(hypervisor) => hypervisor,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<Job>();
                if ready_tx.send(Ok((jobs_tx, runtime.handle().clone()))).is_err() {
                    return;
                }

                runtime.block_on(async move {
                    while let Some(job) = jobs_rx.recv().await {
                        job(hypervisor.as_mut());
                    }
                });
                tracing::debug!("vm queue drained");
            })?;

        let (jobs, runtime) = ready_rx.recv().map_err(|_| Error::QueueClosed)??;

        Ok(Self {
            jobs: Some(jobs),
            runtime,
            worker: Some(worker),
        })
    }

    /// Run `f` on the worker and wait for its result.
    ///
    /// Must not be called from the worker itself (including tasks spawned
    /// on [`handle`](Self::handle)); that would deadlock.
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Hypervisor) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .as_ref()
            .ok_or(Error::QueueClosed)?
            .send(Box::new(move |hypervisor| {
                let _ = tx.send(f(hypervisor));
            }))
            .map_err(|_| Error::QueueClosed)?;

        rx.blocking_recv().map_err(|_| Error::QueueClosed)?
    }

    /// Runtime driven by the worker thread.
    pub fn handle(&self) -> &Handle {
        &self.runtime
    }

    /// Close the queue and wait for queued jobs to finish.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("vm queue worker panicked");
            }
        }
    }
}

impl Drop for VmQueue {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{EventSink, MachineSpec, ResourceLimits, RosettaAvailability};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::ThreadId;

    /// Records which thread each call ran on.
    struct ThreadProbe {
        calls: Vec<ThreadId>,
    }

    impl Hypervisor for ThreadProbe {
        fn limits(&self) -> ResourceLimits {
            ResourceLimits {
                min_cpus: 1,
                max_cpus: 1,
                min_memory_bytes: 0,
                max_memory_bytes: 0,
            }
        }

        fn rosetta_availability(&self) -> RosettaAvailability {
            RosettaAvailability::NotSupported
        }

        fn create(&mut self, _spec: &MachineSpec, _events: EventSink) -> Result<()> {
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            self.calls.push(thread::current().id());
            Ok(())
        }

        fn request_stop(&mut self) -> Result<()> {
            Err(Error::hypervisor("cannot stop"))
        }

        fn release(&mut self) {}
    }

    fn probe_queue() -> VmQueue {
        VmQueue::spawn(|| Ok(Box::new(ThreadProbe { calls: Vec::new() }) as Box<dyn Hypervisor>))
            .unwrap()
    }

    #[test]
    fn test_calls_run_on_worker_thread() {
        let queue = probe_queue();
        let caller = thread::current().id();

        queue.call(|hv| hv.start()).unwrap();
        queue.call(|hv| hv.start()).unwrap();
        let worker = queue.call(|_| Ok(thread::current().id())).unwrap();

        assert_ne!(worker, caller);
        queue.shutdown();
    }

    #[test]
    fn test_errors_propagate() {
        let queue = probe_queue();
        assert!(matches!(
            queue.call(|hv| hv.request_stop()),
            Err(Error::Hypervisor(_))
        ));
        assert_eq!(queue.call(|hv| Ok(hv.limits().max_cpus)).unwrap(), 1);
        queue.shutdown();
    }

    #[test]
    fn test_factory_failure() {
        let result = VmQueue::spawn(|| Err(Error::HypervisorUnavailable("none".into())));
        assert!(matches!(result, Err(Error::HypervisorUnavailable(_))));
    }

    #[test]
    fn test_spawned_tasks_share_worker() {
        let queue = probe_queue();
        let worker = queue.call(|_| Ok(thread::current().id())).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        queue.handle().spawn(async move {
            let _ = tx.send(thread::current().id());
        });
        assert_eq!(rx.recv().unwrap(), worker);
        queue.shutdown();
    }

    /// Sets its flag when the worker drops it.
    struct Tracked(Arc<AtomicBool>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Hypervisor for Tracked {
        fn limits(&self) -> ResourceLimits {
            ThreadProbe { calls: Vec::new() }.limits()
        }

        fn rosetta_availability(&self) -> RosettaAvailability {
            RosettaAvailability::NotSupported
        }

        fn create(&mut self, _spec: &MachineSpec, _events: EventSink) -> Result<()> {
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn request_stop(&mut self) -> Result<()> {
            Ok(())
        }

        fn release(&mut self) {}
    }

    #[test]
    fn test_drop_releases_hypervisor_on_worker() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&dropped);
        let queue =
            VmQueue::spawn(move || Ok(Box::new(Tracked(flag)) as Box<dyn Hypervisor>)).unwrap();

        queue.call(|hv| hv.start()).unwrap();
        assert!(!dropped.load(Ordering::SeqCst));

        drop(queue);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_calls_are_serialized() {
        let queue = Arc::new(probe_queue());
        let counter = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let queue = Arc::clone(&queue);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    queue
                        .call(move |_| {
                            counter.lock().push(i);
                            Ok(())
                        })
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.lock().len(), 4);
    }
}
