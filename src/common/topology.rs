// src/common/topology.rs
// Exchange/queue/binding declarations, recorded so they can be re-asserted
// after every reconnect.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::amqp_client::BrokerChannel;
use super::errors::Result;
use crate::config::TopologyNames;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Pattern-matched routing keys (`*` one word, `#` zero or more)
    Topic,
    /// Exact routing key match
    Direct,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopologyDeclaration {
    Exchange {
        name: String,
        kind: ExchangeKind,
    },
    Queue {
        name: String,
    },
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

impl TopologyDeclaration {
    pub fn exchange(name: &str, kind: ExchangeKind) -> Self {
        TopologyDeclaration::Exchange {
            name: name.to_string(),
            kind,
        }
    }

    pub fn queue(name: &str) -> Self {
        TopologyDeclaration::Queue {
            name: name.to_string(),
        }
    }

    pub fn binding(queue: &str, exchange: &str, routing_key: &str) -> Self {
        TopologyDeclaration::Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    pub async fn apply(&self, channel: &dyn BrokerChannel) -> Result<()> {
        match self {
            TopologyDeclaration::Exchange { name, kind } => {
                channel.declare_exchange(name, *kind).await
            }
            TopologyDeclaration::Queue { name } => channel.declare_queue(name).await,
            TopologyDeclaration::Binding {
                queue,
                exchange,
                routing_key,
            } => channel.bind_queue(queue, exchange, routing_key).await,
        }
    }
}

impl fmt::Display for TopologyDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyDeclaration::Exchange { name, kind } => {
                write!(f, "exchange '{}' ({:?})", name, kind)
            }
            TopologyDeclaration::Queue { name } => write!(f, "queue '{}'", name),
            TopologyDeclaration::Binding {
                queue,
                exchange,
                routing_key,
            } => write!(f, "binding '{}' -> '{}' [{}]", exchange, queue, routing_key),
        }
    }
}

/// Remembers every declaration once, in first-seen order.
#[derive(Debug, Default)]
pub struct TopologyRegistrar {
    declarations: Mutex<Vec<TopologyDeclaration>>,
}

impl TopologyRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if an identical declaration was already recorded.
    pub fn record(&self, declaration: TopologyDeclaration) -> bool {
        let mut declarations = self
            .declarations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if declarations.contains(&declaration) {
            return false;
        }
        declarations.push(declaration);
        true
    }

    pub fn declarations(&self) -> Vec<TopologyDeclaration> {
        self.declarations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.declarations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-asserts everything on `channel`. Returns the number of failures.
    pub async fn replay(&self, channel: &dyn BrokerChannel) -> usize {
        let mut failures = 0;
        for declaration in self.declarations() {
            match declaration.apply(channel).await {
                Ok(()) => debug!("Re-asserted {}", declaration),
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, "Failed to re-assert {}", declaration);
                }
            }
        }
        failures
    }
}

/// Event distribution topology: a topic exchange for domain events, a direct
/// exchange for notifications and the standard consumer queues.
pub fn standard_topology(names: &TopologyNames) -> Vec<TopologyDeclaration> {
    vec![
        TopologyDeclaration::exchange(&names.events_exchange, ExchangeKind::Topic),
        TopologyDeclaration::exchange(&names.notifications_exchange, ExchangeKind::Direct),
        TopologyDeclaration::queue(&names.notification_queue),
        TopologyDeclaration::queue(&names.partnership_queue),
        TopologyDeclaration::queue(&names.analytics_queue),
        TopologyDeclaration::queue(&names.email_queue),
        TopologyDeclaration::binding(&names.notification_queue, &names.events_exchange, "notification.#"),
        TopologyDeclaration::binding(&names.partnership_queue, &names.events_exchange, "partnership.#"),
        TopologyDeclaration::binding(&names.analytics_queue, &names.events_exchange, "#"),
        TopologyDeclaration::binding(
            &names.email_queue,
            &names.notifications_exchange,
            &names.email_routing_key,
        ),
    ]
}

/// Request/response topology: direct exchanges with one queue each way.
pub fn rpc_topology(names: &TopologyNames) -> Vec<TopologyDeclaration> {
    vec![
        TopologyDeclaration::exchange(&names.request_exchange, ExchangeKind::Direct),
        TopologyDeclaration::exchange(&names.response_exchange, ExchangeKind::Direct),
        TopologyDeclaration::queue(&names.request_queue),
        TopologyDeclaration::queue(&names.response_queue),
        TopologyDeclaration::binding(
            &names.request_queue,
            &names.request_exchange,
            &names.request_routing_key,
        ),
        TopologyDeclaration::binding(
            &names.response_queue,
            &names.response_exchange,
            &names.response_routing_key,
        ),
    ]
}

/// AMQP topic matching: words are split on `.`, `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((first, key_rest)) if word == "*" || word == *first => {
                match_words(rest, key_rest)
            }
            _ => false,
        },
    }
}
