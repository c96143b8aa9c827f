//! Channel-backed dispatch: runs message handlers and agent lifecycle hooks
//! on a single task, away from the connection read loops.

use std::any::TypeId;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use async_trait::async_trait;
use proto::{DispatchError, Message, NamedMessage};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::agent::AgentHandle;
use crate::gate::LifecycleTarget;
use crate::processor::{Delivery, MessageRouter};

type MessageHandler = Box<dyn FnMut(Box<dyn Message>, AgentHandle) + Send>;
type AgentHook = Box<dyn FnMut(AgentHandle) + Send>;
type CloseHook = Box<dyn FnMut(AgentHandle) -> anyhow::Result<()> + Send>;

enum Call {
    NewAgent(AgentHandle),
    CloseAgent(AgentHandle, oneshot::Sender<Result<(), DispatchError>>),
    Message(Delivery),
}

fn try_send_error<T>(err: mpsc::error::TrySendError<T>) -> DispatchError {
    match err {
        mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
        mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
    }
}

/// Handler table plus the queue feeding it.
pub struct ChanRpcServer {
    tx: mpsc::Sender<Call>,
    rx: mpsc::Receiver<Call>,
    handlers: HashMap<TypeId, MessageHandler>,
    on_new: Option<AgentHook>,
    on_close: Option<CloseHook>,
}

impl ChanRpcServer {
    /// Creates a server whose queue holds at most `capacity` pending calls.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx,
            handlers: HashMap::new(),
            on_new: None,
            on_close: None,
        }
    }

    /// Returns a client that enqueues into this server.
    pub fn client(&self) -> ChanRpc {
        ChanRpc {
            tx: self.tx.clone(),
        }
    }

    /// Handles routed `T` messages.
    pub fn handle<T, F>(&mut self, mut handler: F) -> &mut Self
    where
        T: NamedMessage,
        F: FnMut(T, AgentHandle) + Send + 'static,
    {
        self.handlers.insert(
            TypeId::of::<T>(),
            Box::new(move |msg: Box<dyn Message>, agent| match msg.downcast::<T>() {
                Some(msg) => handler(*msg, agent),
                None => error!(msg_type = T::NAME, "delivery does not match handler type"),
            }),
        );
        self
    }

    /// Runs `hook` for every new agent.
    pub fn on_new_agent<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(AgentHandle) + Send + 'static,
    {
        self.on_new = Some(Box::new(hook));
        self
    }

    /// Runs `hook` for every closing agent; its error is returned to the caller.
    pub fn on_close_agent<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(AgentHandle) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Drains the queue until `stop` fires or every client is dropped.
    pub async fn run(self, stop: CancellationToken) {
        let Self {
            tx,
            mut rx,
            mut handlers,
            mut on_new,
            mut on_close,
        } = self;
        drop(tx);

        loop {
            let call = tokio::select! {
                _ = stop.cancelled() => break,
                call = rx.recv() => match call {
                    Some(call) => call,
                    None => break,
                },
            };
            match call {
                Call::Message(delivery) => {
                    let Some(handler) = handlers.get_mut(&delivery.type_id) else {
                        warn!(msg_type = delivery.type_name, "no handler for message");
                        continue;
                    };
                    let Delivery {
                        type_name,
                        message,
                        agent,
                        ..
                    } = delivery;
                    if catch_unwind(AssertUnwindSafe(|| handler(message, agent))).is_err() {
                        error!(msg_type = type_name, "message handler panicked");
                    }
                }
                Call::NewAgent(agent) => {
                    if let Some(hook) = on_new.as_mut()
                        && catch_unwind(AssertUnwindSafe(|| hook(agent))).is_err()
                    {
                        error!("new agent hook panicked");
                    }
                }
                Call::CloseAgent(agent, reply) => {
                    let result = match on_close.as_mut() {
                        Some(hook) => match catch_unwind(AssertUnwindSafe(|| hook(agent))) {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(DispatchError::Handler(e.to_string())),
                            Err(_) => Err(DispatchError::Handler("close hook panicked".into())),
                        },
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                }
            }
        }
        debug!("chanrpc server stopped");
    }
}

/// Cloneable entry point into a [`ChanRpcServer`].
#[derive(Clone)]
pub struct ChanRpc {
    tx: mpsc::Sender<Call>,
}

impl MessageRouter for ChanRpc {
    fn deliver(&self, delivery: Delivery) -> Result<(), DispatchError> {
        self.tx
            .try_send(Call::Message(delivery))
            .map_err(try_send_error)
    }
}

#[async_trait]
impl LifecycleTarget for ChanRpc {
    async fn new_agent(&self, agent: AgentHandle) {
        if self.tx.send(Call::NewAgent(agent)).await.is_err() {
            warn!("new agent notification dropped: dispatch target closed");
        }
    }

    async fn close_agent(&self, agent: AgentHandle) -> Result<(), DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Call::CloseAgent(agent, reply_tx))
            .await
            .map_err(|_| DispatchError::Closed)?;
        reply_rx.await.map_err(|_| DispatchError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_agent;
    use parking_lot::Mutex;
    use proto::AgentId;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl NamedMessage for Ping {
        const NAME: &'static str = "Ping";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Orphan;

    impl NamedMessage for Orphan {
        const NAME: &'static str = "Orphan";
    }

    fn delivery<T: NamedMessage>(msg: T, agent: AgentHandle) -> Delivery {
        Delivery {
            type_id: TypeId::of::<T>(),
            type_name: T::NAME,
            message: Box::new(msg),
            agent,
        }
    }

    #[tokio::test]
    async fn delivers_messages_to_typed_handler_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut server = ChanRpcServer::new(16);
        {
            let seen = seen.clone();
            server.handle::<Ping, _>(move |ping, _agent| seen.lock().push(ping.seq));
        }
        let client = server.client();
        let stop = CancellationToken::new();
        let task = tokio::spawn(server.run(stop.clone()));

        let (agent, _conn) = test_agent();
        for seq in 0..5 {
            client
                .deliver(delivery(Ping { seq }, agent.clone()))
                .expect("enqueue");
        }
        client
            .deliver(delivery(Orphan, agent.clone()))
            .expect("unhandled types are still enqueued");
        drop(client);
        drop(agent);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("server drains and stops")
            .expect("no panic");
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn full_queue_fails_fast() {
        let server = ChanRpcServer::new(1);
        let client = server.client();
        let (agent, _conn) = test_agent();

        client
            .deliver(delivery(Ping { seq: 1 }, agent.clone()))
            .expect("first fits");
        let err = client
            .deliver(delivery(Ping { seq: 2 }, agent))
            .expect_err("queue is full");
        assert_eq!(err, DispatchError::QueueFull);
    }

    #[tokio::test]
    async fn stopped_server_refuses_deliveries() {
        let server = ChanRpcServer::new(4);
        let client = server.client();
        let stop = CancellationToken::new();
        stop.cancel();
        server.run(stop).await;

        let (agent, _conn) = test_agent();
        let err = client
            .deliver(delivery(Ping { seq: 1 }, agent.clone()))
            .expect_err("server is gone");
        assert_eq!(err, DispatchError::Closed);
        assert_eq!(
            client.close_agent(agent).await,
            Err(DispatchError::Closed)
        );
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_in_order_and_report_errors() {
        let events: Arc<Mutex<Vec<(&'static str, AgentId)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut server = ChanRpcServer::new(8);
        {
            let events = events.clone();
            server.on_new_agent(move |agent| events.lock().push(("new", agent.id())));
        }
        {
            let events = events.clone();
            server.on_close_agent(move |agent| {
                events.lock().push(("close", agent.id()));
                anyhow::bail!("session store offline")
            });
        }
        let client = server.client();
        let stop = CancellationToken::new();
        let task = tokio::spawn(server.run(stop.clone()));

        let (agent, _conn) = test_agent();
        client.new_agent(agent.clone()).await;
        let err = client
            .close_agent(agent.clone())
            .await
            .expect_err("hook error is surfaced");
        assert!(matches!(err, DispatchError::Handler(ref m) if m.contains("offline")));

        assert_eq!(
            *events.lock(),
            vec![("new", agent.id()), ("close", agent.id())]
        );
        stop.cancel();
        task.await.expect("no panic");
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_server() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut server = ChanRpcServer::new(8);
        {
            let seen = seen.clone();
            server.handle::<Ping, _>(move |ping, _agent| {
                assert!(ping.seq != 1, "boom");
                seen.lock().push(ping.seq);
            });
        }
        let client = server.client();
        let stop = CancellationToken::new();
        let task = tokio::spawn(server.run(stop.clone()));

        let (agent, _conn) = test_agent();
        for seq in 0..3 {
            client
                .deliver(delivery(Ping { seq }, agent.clone()))
                .expect("enqueue");
        }
        client.close_agent(agent).await.expect("no close hook");

        assert_eq!(*seen.lock(), vec![0, 2]);
        stop.cancel();
        task.await.expect("no panic");
    }
}
