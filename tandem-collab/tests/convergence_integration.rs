//! Convergence of many clients against one sequenced document.
//!
//! A small in-process network: each client has an ordered queue to the
//! server and one back, and the "server" is a bare [`Document`] driven the
//! way the sequencer drives it. Deliveries interleave arbitrarily; once
//! every queue drains all replicas must equal the authoritative state.

use std::collections::VecDeque;

use proptest::prelude::*;
use proptest::test_runner::Config;
use tandem_collab::document::{AppliedOperation, Bootstrap, Document};
use tandem_collab::protocol::{ClientMessage, ServerMessage, UserId};
use tandem_collab::ClientDocument;
use uuid::Uuid;

struct Network {
    server: Document,
    subscribed: Vec<bool>,
    users: Vec<UserId>,
    clients: Vec<ClientDocument>,
    uplink: Vec<VecDeque<ClientMessage>>,
    downlink: Vec<VecDeque<ServerMessage>>,
}

impl Network {
    fn new(clients: usize, window: usize) -> Self {
        let document_id = Uuid::new_v4();
        let mut net = Self {
            server: Document::new(document_id, window),
            subscribed: vec![false; clients],
            users: Vec::new(),
            clients: Vec::new(),
            uplink: Vec::new(),
            downlink: Vec::new(),
        };
        for _ in 0..clients {
            let user = Uuid::new_v4();
            let mut client = ClientDocument::new(document_id);
            client.set_user(user);
            net.uplink.push(VecDeque::from([client.subscribe_message()]));
            net.downlink.push(VecDeque::new());
            net.users.push(user);
            net.clients.push(client);
        }
        net
    }

    fn edit(&mut self, i: usize, seed: usize, text: &str, delete: bool) {
        let client = &mut self.clients[i];
        let len = client.len();
        let reply = if delete && len > 0 {
            let pos = seed % len;
            client.delete(pos, (seed % 3 + 1).min(len - pos)).unwrap()
        } else {
            client.insert(seed % (len + 1), text).unwrap()
        };
        self.uplink[i].extend(reply);
    }

    /// Deliver one message from client `i` to the server.
    fn to_server(&mut self, i: usize) -> bool {
        let Some(msg) = self.uplink[i].pop_front() else {
            return false;
        };
        match msg {
            ClientMessage::Subscribe {
                last_seen_version, ..
            } => match self.server.bootstrap(last_seen_version, self.users[i]) {
                Ok(bootstrap) => {
                    let (checkpoint, replay) = match bootstrap {
                        Bootstrap::Replay(ops) => (None, ops),
                        Bootstrap::Checkpoint {
                            checkpoint,
                            operations,
                        } => (Some(checkpoint), operations),
                    };
                    self.subscribed[i] = true;
                    self.downlink[i].push_back(ServerMessage::Subscribed {
                        document_id: self.server.id(),
                        current_version: self.server.version(),
                        checkpoint,
                        replay_operations: replay
                            .iter()
                            .map(|op| op.to_versioned().unwrap())
                            .collect(),
                    });
                }
                Err(e) => self.reject(i, None, &e),
            },
            ClientMessage::SubmitOperation {
                base_version,
                operation,
                client_op_id,
                ..
            } => {
                if let Some(version) = self.server.applied_version(self.users[i], client_op_id) {
                    self.downlink[i].push_back(ServerMessage::Ack {
                        document_id: self.server.id(),
                        version,
                        client_op_id,
                    });
                    return true;
                }
                let op = tandem_ot::decode(&operation).unwrap();
                match self
                    .server
                    .submit(op, base_version, self.users[i], Some(client_op_id))
                {
                    Ok(applied) => self.publish(i, &applied),
                    Err(e) => self.reject(i, Some(client_op_id), &e),
                }
            }
            other => panic!("unexpected client message {other:?}"),
        }
        true
    }

    fn publish(&mut self, author: usize, applied: &AppliedOperation) {
        let versioned = applied.to_versioned().unwrap();
        for j in 0..self.clients.len() {
            if !self.subscribed[j] {
                continue;
            }
            let msg = if j == author {
                ServerMessage::Ack {
                    document_id: applied.document_id,
                    version: applied.version,
                    client_op_id: versioned.client_op_id.unwrap(),
                }
            } else {
                ServerMessage::OperationBroadcast {
                    document_id: applied.document_id,
                    version: versioned.version,
                    operation: versioned.operation.clone(),
                    author_id: versioned.author_id,
                    client_op_id: versioned.client_op_id,
                }
            };
            self.downlink[j].push_back(msg);
        }
    }

    fn reject(&mut self, i: usize, client_op_id: Option<u64>, err: &tandem_collab::CollabError) {
        self.downlink[i].push_back(ServerMessage::Reject {
            document_id: Some(self.server.id()),
            client_op_id,
            reason: err.reject_reason(),
            current_version: err.current_version(),
        });
    }

    /// Deliver one message from the server to client `i`.
    fn to_client(&mut self, i: usize) -> bool {
        let Some(msg) = self.downlink[i].pop_front() else {
            return false;
        };
        let reply = self.clients[i].handle(&msg).unwrap();
        self.uplink[i].extend(reply);
        true
    }

    fn drain(&mut self) {
        let mut steps = 0;
        loop {
            let mut moved = false;
            for i in 0..self.clients.len() {
                moved |= self.to_server(i);
                moved |= self.to_client(i);
            }
            if !moved {
                break;
            }
            steps += 1;
            assert!(steps < 10_000, "network never quiesced");
        }
    }

    fn assert_converged(&self) {
        for (i, client) in self.clients.iter().enumerate() {
            assert!(!client.has_pending(), "client {i} still has pending edits");
            assert_eq!(client.version(), self.server.version(), "client {i} version");
            assert_eq!(client.content(), self.server.state(), "client {i} content");
        }
    }
}

#[test]
fn test_three_clients_type_at_the_same_spot() {
    let mut net = Network::new(3, 64);
    net.drain();

    net.edit(0, 0, "A", false);
    net.edit(1, 0, "B", false);
    net.edit(2, 0, "C", false);
    // Server sees client 2 first, then 0, then 1.
    net.to_server(2);
    net.to_server(0);
    net.to_server(1);
    net.drain();

    net.assert_converged();
    assert_eq!(net.server.state(), "CAB");
}

#[test]
fn test_edits_before_first_subscribe_are_rebased() {
    let mut net = Network::new(2, 64);
    // Client 1 types before anything reaches the server.
    net.edit(1, 0, "offline", false);
    net.to_server(0);
    net.to_client(0);
    net.edit(0, 0, "online ", false);
    net.drain();

    net.assert_converged();
    assert_eq!(net.server.version(), 2);
    assert_eq!(net.server.state().chars().count(), "online offline".len());
}

#[test]
fn test_lagging_client_past_window_resyncs() {
    let mut net = Network::new(2, 4);
    net.drain();

    // Client 1 goes quiet while client 0 makes many edits.
    net.edit(1, 0, "late", false);
    for n in 0..12 {
        net.edit(0, n, "x", false);
        while net.to_server(0) | net.to_client(0) {}
    }
    net.drain();

    net.assert_converged();
    assert!(net.server.state().contains("late"));
}

/// One step of a random schedule: (client, action, seed, text).
type Step = (usize, u8, usize, String);

fn schedule() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec((0usize..4, 0u8..5, 0usize..64, "[a-dü]{1,3}"), 1..60)
}

proptest! {
    #![proptest_config(Config::with_cases(128))]

    #[test]
    fn replicas_converge(steps in schedule(), window in 3usize..32) {
        let mut net = Network::new(4, window);
        for (client, action, seed, text) in steps {
            match action {
                0 => net.edit(client, seed, &text, false),
                1 => net.edit(client, seed, &text, true),
                2 => {
                    net.to_server(client);
                }
                3 => {
                    net.to_client(client);
                }
                _ => {
                    for i in 0..4 {
                        net.to_server(i);
                    }
                }
            }
        }
        net.drain();
        for client in &net.clients {
            prop_assert!(!client.has_pending());
            prop_assert_eq!(client.content(), net.server.state());
        }
    }
}
