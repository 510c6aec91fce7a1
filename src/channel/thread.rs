use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use crate::channel::port::{self, Port};
use crate::channel::{Channel, ChannelId, ErrorObserver, ListenerId, MessageListener};
use crate::errors::ChannelError;
use crate::message_handler::{Envelope, SharedBuffer};
use crate::sync::lock;

#[derive(Default)]
struct FailureState {
    reason: Option<String>,
    observers: Vec<ErrorObserver>,
}

/// Channel to a backend that runs on a dedicated OS thread with its own current-thread runtime.
///
/// The thread lives until the client end is closed. If bootstrapping fails or panics, registered error
/// observers are told why.
pub struct ThreadChannel {
    name: String,
    port: Port,
    failure: Arc<Mutex<FailureState>>,
}

impl ThreadChannel {
    /// Starts the worker thread. `bootstrap` runs on that thread, inside its runtime, with the worker end of
    /// the channel. Whatever it returns is kept alive until the channel closes.
    pub fn spawn<F, R>(name: &str, bootstrap: F) -> Result<Arc<ThreadChannel>, ChannelError>
    where
        F: FnOnce(Arc<dyn Channel>) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (client, worker) = port::pair();
        let failure = Arc::new(Mutex::new(FailureState::default()));
        let thread_failure = failure.clone();
        let thread_name = name.to_string();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || run_worker(worker, bootstrap)));
                let reason = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("{err:#}")),
                    Err(panic) => Some(panic_message(panic)),
                };
                if let Some(reason) = reason {
                    log::warn!("Worker[{}]: worker thread failed: {}", thread_name, reason);
                    report_failure(&thread_failure, reason);
                }
            })
            .map_err(|e| ChannelError::Spawn(e.to_string()))?;

        Ok(Arc::new(ThreadChannel {
            name: name.to_string(),
            port: client,
            failure,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Channel for ThreadChannel {
    fn id(&self) -> ChannelId {
        self.port.id()
    }

    fn send(&self, mut envelope: Envelope, transfers: &[SharedBuffer]) -> Result<(), ChannelError> {
        if let Some(payload) = envelope.payload_mut() {
            port::structured_clone(payload, transfers);
        }
        self.port.post(envelope)
    }

    fn on_message(&self, listener: MessageListener) -> ListenerId {
        self.port.subscribe(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.port.unsubscribe(id);
    }

    fn on_error(&self, observer: ErrorObserver) {
        let mut state = lock(&self.failure);
        match state.reason.clone() {
            Some(reason) => {
                drop(state);
                observer(reason);
            }
            None => state.observers.push(observer),
        }
    }

    fn close(&self) {
        self.port.close();
    }
}

/// The worker side of a [`ThreadChannel`].
struct WorkerEndpoint {
    port: Port,
}

impl Channel for WorkerEndpoint {
    fn id(&self) -> ChannelId {
        self.port.id()
    }

    fn send(&self, mut envelope: Envelope, transfers: &[SharedBuffer]) -> Result<(), ChannelError> {
        if let Some(payload) = envelope.payload_mut() {
            port::structured_clone(payload, transfers);
        }
        self.port.post(envelope)
    }

    fn on_message(&self, listener: MessageListener) -> ListenerId {
        self.port.subscribe(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.port.unsubscribe(id);
    }

    fn close(&self) {
        self.port.close();
    }
}

fn run_worker<F, R>(port: Port, bootstrap: F) -> anyhow::Result<()>
where
    F: FnOnce(Arc<dyn Channel>) -> anyhow::Result<R>,
{
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async move {
        let closed = port.closed();
        let endpoint: Arc<dyn Channel> = Arc::new(WorkerEndpoint { port });
        let _keep_alive = bootstrap(endpoint.clone())?;
        closed.cancelled().await;
        endpoint.close();
        Ok(())
    })
}

fn report_failure(failure: &Mutex<FailureState>, reason: String) {
    let observers = {
        let mut state = lock(failure);
        state.reason = Some(reason.clone());
        std::mem::take(&mut state.observers)
    };
    for observer in observers {
        observer(reason.clone());
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker thread panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_handler::{Action, Message, Payload, ReplyMode};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echoes_through_worker_thread() {
        let channel = ThreadChannel::spawn("echo-worker", |endpoint: Arc<dyn Channel>| {
            let reply_to = endpoint.clone();
            endpoint.on_message(Arc::new(move |envelope: Envelope| {
                let _ = reply_to.send(
                    Envelope {
                        source: envelope.target,
                        target: envelope.source,
                        message: envelope.message,
                    },
                    &[],
                );
            }));
            Ok(())
        })
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message(Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        }));
        channel
            .send(
                Envelope {
                    source: "main".into(),
                    target: "worker".into(),
                    message: Message::Call {
                        action: Action::Test,
                        reply: ReplyMode::None,
                        data: Payload::new(serde_json::json!("ping")),
                    },
                },
                &[],
            )
            .unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(echoed.source, "worker");
        channel.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_bootstrap_panics() {
        let channel = ThreadChannel::spawn("broken-worker", |_endpoint| -> anyhow::Result<()> {
            panic!("backend exploded");
        })
        .unwrap();

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        channel.on_error(Arc::new(move |reason| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(reason);
            }
        }));

        let reason = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert!(reason.contains("backend exploded"));
    }
}
