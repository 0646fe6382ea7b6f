//! In-process loopback transport.
//!
//! Every subscription, call, reply and broadcast is queued and only
//! delivered by [`LocalNetwork::run_until_idle`], in FIFO order. That makes
//! the asynchronous hop between authority and mirrors explicit and
//! deterministic, which is what the unit tests rely on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{ClientTransport, NotificationHandler, Payload, Procedure, Reply, ServerTransport};
use crate::error::Error;

enum Delivery {
    Subscribe {
        client: u64,
        event: String,
        handler: NotificationHandler,
    },
    Call {
        method: String,
        params: Option<Payload>,
        reply: Reply,
    },
    Reply {
        reply: Reply,
        result: crate::Result<Payload>,
    },
    Notify {
        event: String,
        handler: NotificationHandler,
        payload: Payload,
    },
}

struct Hub {
    online: bool,
    next_client: u64,
    procedures: HashMap<String, Procedure>,
    events: HashMap<String, Vec<(u64, NotificationHandler)>>,
    queue: VecDeque<Delivery>,
    emitted: Vec<(String, Payload)>,
}

/// A shared in-memory network with one server side and any number of clients
#[derive(Clone)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                online: true,
                next_client: 0,
                procedures: HashMap::new(),
                events: HashMap::new(),
                queue: VecDeque::new(),
                emitted: Vec::new(),
            })),
        }
    }

    /// Server-side handle
    pub fn server(&self) -> LocalServer {
        LocalServer { net: self.clone() }
    }

    /// A new client-side handle with its own subscriptions
    pub fn client(&self) -> LocalClient {
        let mut hub = self.hub.lock();
        hub.next_client += 1;
        LocalClient {
            net: self.clone(),
            id: hub.next_client,
        }
    }

    /// Take the server side on or off the network.
    ///
    /// Going offline drops every subscription, like a lost connection would.
    pub fn set_online(&self, online: bool) {
        let mut hub = self.hub.lock();
        hub.online = online;
        if !online {
            for subscribers in hub.events.values_mut() {
                subscribers.clear();
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.hub.lock().online
    }

    /// Number of queued, undelivered messages
    pub fn pending(&self) -> usize {
        self.hub.lock().queue.len()
    }

    /// Every broadcast emitted so far, in order
    pub fn emitted(&self) -> Vec<(String, Payload)> {
        self.hub.lock().emitted.clone()
    }

    /// Deliver queued messages until nothing is left, including messages
    /// produced while delivering. Returns how many were delivered.
    pub fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
        }
        delivered
    }

    /// Deliver a single queued message
    pub fn step(&self) -> bool {
        let Some(delivery) = self.hub.lock().queue.pop_front() else {
            return false;
        };

        match delivery {
            Delivery::Subscribe {
                client,
                event,
                handler,
            } => {
                let mut hub = self.hub.lock();
                let online = hub.online;
                match hub.events.get_mut(&event) {
                    Some(subscribers) if online => subscribers.push((client, handler)),
                    Some(_) => debug!(%event, client, "subscription refused, server offline"),
                    None => debug!(%event, client, "subscription refused, event not declared"),
                }
            }
            Delivery::Call {
                method,
                params,
                reply,
            } => {
                let procedure = {
                    let hub = self.hub.lock();
                    if hub.online {
                        hub.procedures
                            .get(&method)
                            .cloned()
                            .ok_or_else(|| Error::MethodNotFound(method.clone()))
                    } else {
                        Err(Error::NotConnected)
                    }
                };
                // The lock is released here: procedures may emit.
                let result = procedure.and_then(|procedure| procedure(params));
                trace!(%method, ok = result.is_ok(), "call handled");
                self.enqueue(Delivery::Reply { reply, result });
            }
            Delivery::Reply { reply, result } => reply(result),
            Delivery::Notify {
                event,
                handler,
                payload,
            } => {
                if !handler(payload) {
                    if let Some(subscribers) = self.hub.lock().events.get_mut(&event) {
                        subscribers.retain(|(_, h)| !Arc::ptr_eq(h, &handler));
                    }
                }
            }
        }
        true
    }

    fn enqueue(&self, delivery: Delivery) {
        self.hub.lock().queue.push_back(delivery);
    }
}

/// Server-side handle of a [`LocalNetwork`]
#[derive(Clone)]
pub struct LocalServer {
    net: LocalNetwork,
}

impl ServerTransport for LocalServer {
    fn declare_event(&self, event: &str) {
        self.net
            .hub
            .lock()
            .events
            .entry(event.to_string())
            .or_default();
    }

    fn register(&self, method: &str, procedure: Procedure) {
        self.net
            .hub
            .lock()
            .procedures
            .insert(method.to_string(), procedure);
    }

    fn emit(&self, event: &str, payload: Payload) {
        let mut hub = self.net.hub.lock();
        hub.emitted.push((event.to_string(), payload.clone()));
        let handlers: Vec<NotificationHandler> = hub
            .events
            .get(event)
            .map(|subscribers| subscribers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            hub.queue.push_back(Delivery::Notify {
                event: event.to_string(),
                handler,
                payload: payload.clone(),
            });
        }
    }
}

/// Client-side handle of a [`LocalNetwork`]
#[derive(Clone)]
pub struct LocalClient {
    net: LocalNetwork,
    id: u64,
}

impl ClientTransport for LocalClient {
    fn subscribe(&self, event: &str, handler: NotificationHandler) {
        self.net.enqueue(Delivery::Subscribe {
            client: self.id,
            event: event.to_string(),
            handler,
        });
    }

    fn call(&self, method: &str, params: Option<Payload>, reply: Reply) {
        if !self.net.is_online() {
            self.net.enqueue(Delivery::Reply {
                reply,
                result: Err(Error::NotConnected),
            });
            return;
        }
        self.net.enqueue(Delivery::Call {
            method: method.to_string(),
            params,
            reply,
        });
    }
}
