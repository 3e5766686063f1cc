use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::common::error::error;
use crate::server::locks::{LockLevel, LockRequest, Lockset};
use crate::transfer::connection::Connection;
use crate::transfer::messages::{MessageType, ReplyEnvelope, RequestEnvelope, ReturnCodeMsg};

/// Maximum number of concurrently active workers per agent.
pub const AGENT_THREAD_COUNT: usize = 10;

/// Wall-clock budget for a single worker's RPC.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on node name length; longer names are a programmer error.
pub const MAX_NAME_LEN: usize = 64;

/// Per-request limits. `Default` uses the build-time constants; scenarios
/// that need a faster timeout pass their own.
#[derive(Debug, Clone, Copy)]
pub struct AgentLimits {
    pub thread_count: usize,
    pub command_timeout: Duration,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            thread_count: AGENT_THREAD_COUNT,
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

impl AgentLimits {
    /// The watchdog polls faster when the command timeout is down to one
    /// second, otherwise every two seconds.
    fn wdog_poll(&self) -> Duration {
        if self.command_timeout <= Duration::from_secs(1) {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(2)
        }
    }
}

/// One target of an agent request.
#[derive(Debug, Clone)]
pub struct AgentTarget {
    pub addr: SocketAddr,
    pub node_name: String,
}

/// A batch RPC to be transmitted in parallel across a set of nodes.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
    pub targets: Vec<AgentTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    New,
    Active,
    Done,
    Failed,
}

/// Per-target worker state, shared between the worker and the watchdog.
struct WorkerRecord {
    state: WorkerState,
    /// Set when the worker goes active.
    started: Option<Instant>,
    /// Total wall-clock of a finished worker.
    elapsed: Option<Duration>,
    node_name: String,
    cancel: CancellationToken,
}

struct AgentInner {
    workers: Mutex<Vec<WorkerRecord>>,
    limits: AgentLimits,
}

/// Transmit one RPC in parallel across the request's targets and reconcile
/// the outcomes into the controller's node table.
///
/// Up to `limits.thread_count` workers run at once; a worker that stays
/// active longer than `limits.command_timeout` is cancelled by the watchdog
/// and counts as failed. Returns once every worker is terminal and the node
/// table has been updated. Invalid requests (a non-request message type, an
/// over-long node name) are programmer errors and panic.
pub async fn agent(locks: Arc<Lockset>, request: AgentRequest, limits: AgentLimits) {
    if request.targets.is_empty() {
        return; // nothing to transmit
    }
    assert!(
        request.msg_type.is_agent_request(),
        "agent passed invalid message type {:?}",
        request.msg_type
    );
    assert!(limits.thread_count >= 1, "agent thread count is invalid");
    for target in &request.targets {
        assert!(
            target.node_name.len() <= MAX_NAME_LEN,
            "agent passed over-long node name {}",
            target.node_name
        );
    }

    let workers = request
        .targets
        .iter()
        .map(|target| WorkerRecord {
            state: WorkerState::New,
            started: None,
            elapsed: None,
            node_name: target.node_name.clone(),
            cancel: CancellationToken::new(),
        })
        .collect();
    let inner = Arc::new(AgentInner {
        workers: Mutex::new(workers),
        limits,
    });

    // The watchdog is joinable and is the join point for the whole request.
    let watchdog = tokio::spawn(wdog(inner.clone(), locks));

    let envelope = Arc::new(RequestEnvelope {
        msg_type: request.msg_type,
        payload: request.payload,
    });
    let throttle = Arc::new(Semaphore::new(limits.thread_count));

    for (index, target) in request.targets.into_iter().enumerate() {
        // Wait until there is room for another worker.
        let permit = throttle
            .clone()
            .acquire_owned()
            .await
            .expect("agent throttle closed");
        let inner = inner.clone();
        let envelope = envelope.clone();
        // Workers are detached; the permit is released when the worker
        // reaches a terminal state.
        tokio::spawn(async move {
            per_target_rpc(&inner, index, target.addr, &envelope).await;
            drop(permit);
        });
    }

    if let Err(join_error) = watchdog.await {
        log::error!("agent watchdog task failed: {join_error:?}");
    }
}

/// Send the request to a single target, receive one reply and classify the
/// outcome into the worker record.
async fn per_target_rpc(
    inner: &AgentInner,
    index: usize,
    addr: SocketAddr,
    envelope: &RequestEnvelope,
) {
    let (node_name, cancel) = {
        let mut workers = inner.workers.lock().unwrap();
        let worker = &mut workers[index];
        worker.state = WorkerState::Active;
        worker.started = Some(Instant::now());
        (worker.node_name.clone(), worker.cancel.clone())
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => error("command timeout".to_string()),
        result = issue_rpc(addr, envelope) => result,
    };

    let state = match outcome {
        Ok(()) => {
            log::debug!("agent successfully processed RPC to node {}", node_name);
            WorkerState::Done
        }
        Err(err) => {
            log::error!("agent RPC to node {} failed: {}", node_name, err);
            WorkerState::Failed
        }
    };

    let mut workers = inner.workers.lock().unwrap();
    let worker = &mut workers[index];
    worker.state = state;
    worker.elapsed = worker.started.map(|started| started.elapsed());
}

async fn issue_rpc(addr: SocketAddr, envelope: &RequestEnvelope) -> crate::Result<()> {
    let mut connection: Connection<ReplyEnvelope, RequestEnvelope> =
        Connection::connect(addr).await?;
    let reply = connection.send_and_receive(envelope.clone()).await?;
    connection.shutdown().await?;

    match reply.msg_type {
        MessageType::ResponseReturnCode => {
            let message: ReturnCodeMsg = crate::transfer::deserialize(&reply.payload)?;
            if message.return_code != 0 {
                return error(format!("return code {}", message.return_code));
            }
            Ok(())
        }
        other => error(format!("bad reply message type {other:?}")),
    }
}

/// Watchdog: cancel workers that have been active for too long, and once
/// every worker is terminal, reconcile the results into the node table.
async fn wdog(inner: Arc<AgentInner>, locks: Arc<Lockset>) {
    let poll = inner.limits.wdog_poll();
    let command_timeout = inner.limits.command_timeout;
    let mut max_delay = Duration::ZERO;

    loop {
        tokio::time::sleep(poll).await;

        let mut work_done = true;
        {
            let workers = inner.workers.lock().unwrap();
            for worker in workers.iter() {
                match worker.state {
                    WorkerState::Active => {
                        work_done = false;
                        if let Some(started) = worker.started {
                            if started.elapsed() >= command_timeout {
                                // Fail the worker's pending I/O; the worker
                                // moves itself to Failed.
                                worker.cancel.cancel();
                            }
                        }
                    }
                    WorkerState::New => work_done = false,
                    WorkerState::Done => {
                        if let Some(elapsed) = worker.elapsed {
                            max_delay = max_delay.max(elapsed);
                        }
                    }
                    WorkerState::Failed => {}
                }
            }
        }
        if work_done {
            break;
        }
    }

    // All workers are terminal, so nothing contends on the records anymore
    // and they can be snapshot outside the controller locks.
    let outcomes: Vec<(WorkerState, String)> = {
        let workers = inner.workers.lock().unwrap();
        workers
            .iter()
            .map(|worker| (worker.state, worker.node_name.clone()))
            .collect()
    };

    let fail_cnt = outcomes
        .iter()
        .filter(|(state, _)| *state == WorkerState::Failed)
        .count();

    let mut guard = locks
        .lock(LockRequest {
            job: LockLevel::Write,
            node: LockLevel::Write,
            ..Default::default()
        })
        .await;
    let node_table = guard.node.get_mut();
    if fail_cnt > 0 {
        for (state, node_name) in &outcomes {
            if *state == WorkerState::Failed {
                node_table.node_not_resp(node_name);
            }
        }
    }
    for (state, node_name) in &outcomes {
        if *state == WorkerState::Done {
            node_table.node_did_resp(node_name);
        }
    }
    drop(guard);

    if !max_delay.is_zero() {
        log::debug!("agent maximum delay {} seconds", max_delay.as_secs());
    }
}
