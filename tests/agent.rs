use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use muster::server::agent::{agent, AgentLimits, AgentRequest, AgentTarget};
use muster::server::locks::{LockLevel, LockRequest, Lockset};
use muster::server::node::NodeRecord;
use muster::transfer::connection::Connection;
use muster::transfer::messages::{MessageType, ReplyEnvelope, RequestEnvelope, ReturnCodeMsg};
use muster::transfer::serialize;

#[derive(Debug, Clone, Copy)]
enum NodeBehavior {
    /// Read the request, wait, then reply with the given return code.
    Reply { return_code: i32, delay_ms: u64 },
    /// Read the request and never reply.
    Stall,
}

#[derive(Default)]
struct LoadTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl LoadTracker {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Start a fake compute node on an ephemeral port and return its address.
async fn spawn_node(behavior: NodeBehavior, load: Option<Arc<LoadTracker>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let socket = match listener.accept().await {
                Ok((socket, _)) => socket,
                Err(_) => break,
            };
            let load = load.clone();
            tokio::spawn(async move {
                if let Some(load) = &load {
                    load.enter();
                }
                let mut connection: Connection<RequestEnvelope, ReplyEnvelope> =
                    Connection::new(socket);
                let request = match connection.receive().await {
                    Some(Ok(request)) => request,
                    _ => return,
                };
                assert!(request.msg_type.is_agent_request());
                match behavior {
                    NodeBehavior::Reply {
                        return_code,
                        delay_ms,
                    } => {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let payload = serialize(&ReturnCodeMsg { return_code }).unwrap();
                        let _ = connection
                            .send(ReplyEnvelope {
                                msg_type: MessageType::ResponseReturnCode,
                                payload,
                            })
                            .await;
                    }
                    NodeBehavior::Stall => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                }
                if let Some(load) = &load {
                    load.exit();
                }
            });
        }
    });
    addr
}

async fn register_nodes(locks: &Lockset, targets: &[AgentTarget]) {
    let mut guard = locks
        .lock(LockRequest {
            node: LockLevel::Write,
            ..Default::default()
        })
        .await;
    for target in targets {
        guard
            .node
            .get_mut()
            .insert(NodeRecord::new(target.node_name.clone(), target.addr));
    }
}

async fn node_snapshot(locks: &Lockset, name: &str) -> NodeRecord {
    let guard = locks
        .lock(LockRequest {
            node: LockLevel::Read,
            ..Default::default()
        })
        .await;
    guard.node.get().find(name).unwrap().clone()
}

fn fast_limits(thread_count: usize) -> AgentLimits {
    AgentLimits {
        thread_count,
        command_timeout: Duration::from_secs(1),
    }
}

fn ping_request(targets: Vec<AgentTarget>) -> AgentRequest {
    AgentRequest {
        msg_type: MessageType::RequestPing,
        payload: Vec::new(),
        targets,
    }
}

#[tokio::test]
async fn test_all_targets_respond() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut targets = Vec::new();
    for index in 0..3 {
        let addr = spawn_node(
            NodeBehavior::Reply {
                return_code: 0,
                delay_ms: 10,
            },
            None,
        )
        .await;
        targets.push(AgentTarget {
            addr,
            node_name: format!("n{index}"),
        });
    }
    let locks = Arc::new(Lockset::default());
    register_nodes(&locks, &targets).await;

    agent(locks.clone(), ping_request(targets), fast_limits(4)).await;

    for index in 0..3 {
        let node = node_snapshot(&locks, &format!("n{index}")).await;
        assert!(node.last_response > 0, "node n{index} did not respond");
        assert!(!node.not_responding);
    }
}

#[tokio::test]
async fn test_stalled_target_times_out() {
    let _ = env_logger::builder().is_test(true).try_init();
    let behaviors = [
        NodeBehavior::Reply {
            return_code: 0,
            delay_ms: 10,
        },
        NodeBehavior::Stall,
        NodeBehavior::Reply {
            return_code: 0,
            delay_ms: 10,
        },
    ];
    let mut targets = Vec::new();
    for (index, behavior) in behaviors.iter().enumerate() {
        let addr = spawn_node(*behavior, None).await;
        targets.push(AgentTarget {
            addr,
            node_name: format!("n{index}"),
        });
    }
    let locks = Arc::new(Lockset::default());
    register_nodes(&locks, &targets).await;

    agent(locks.clone(), ping_request(targets), fast_limits(4)).await;

    let stuck = node_snapshot(&locks, "n1").await;
    assert!(stuck.not_responding);
    assert_eq!(stuck.last_response, 0);
    for name in ["n0", "n2"] {
        let node = node_snapshot(&locks, name).await;
        assert!(!node.not_responding);
        assert!(node.last_response > 0);
    }
}

#[tokio::test]
async fn test_pool_saturation() {
    let _ = env_logger::builder().is_test(true).try_init();
    let load = Arc::new(LoadTracker::default());
    let mut targets = Vec::new();
    for index in 0..10 {
        let addr = spawn_node(
            NodeBehavior::Reply {
                return_code: 0,
                delay_ms: 200,
            },
            Some(load.clone()),
        )
        .await;
        targets.push(AgentTarget {
            addr,
            node_name: format!("n{index}"),
        });
    }
    let locks = Arc::new(Lockset::default());
    register_nodes(&locks, &targets).await;

    agent(locks.clone(), ping_request(targets), fast_limits(4)).await;

    assert!(load.peak() <= 4, "observed {} concurrent workers", load.peak());
    for index in 0..10 {
        let node = node_snapshot(&locks, &format!("n{index}")).await;
        assert!(node.last_response > 0, "node n{index} did not respond");
    }
}

#[tokio::test]
async fn test_error_return_code_marks_node_not_responding() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr = spawn_node(
        NodeBehavior::Reply {
            return_code: 2,
            delay_ms: 0,
        },
        None,
    )
    .await;
    let targets = vec![AgentTarget {
        addr,
        node_name: "n0".to_string(),
    }];
    let locks = Arc::new(Lockset::default());
    register_nodes(&locks, &targets).await;

    agent(locks.clone(), ping_request(targets), fast_limits(2)).await;

    let node = node_snapshot(&locks, "n0").await;
    assert!(node.not_responding);
}

#[tokio::test]
#[should_panic(expected = "invalid message type")]
async fn test_invalid_message_type_is_fatal() {
    let locks = Arc::new(Lockset::default());
    let targets = vec![AgentTarget {
        addr: "127.0.0.1:9".parse().unwrap(),
        node_name: "n0".to_string(),
    }];
    agent(
        locks,
        AgentRequest {
            msg_type: MessageType::ResponseReturnCode,
            payload: Vec::new(),
            targets,
        },
        AgentLimits::default(),
    )
    .await;
}
