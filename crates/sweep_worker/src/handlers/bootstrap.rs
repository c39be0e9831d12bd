use std::net::SocketAddr;
use std::sync::Arc;

use sweep_core::contract::ExitState;
use sweep_core::error::SweepError;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::adapters::executable::{Invocation, ProcessExit, TrainingExecutable};
use crate::adapters::rendezvous::RendezvousBarrier;
use crate::config::DistributedConfig;

pub const MASTER_ADDR: &str = "127.0.0.1";
pub const RENDEZVOUS_ENV: &str = "SWEEP_RENDEZVOUS";

/// Copies the single-process invocation for one rank of a fanned-out worker.
pub fn rank_invocation(
    base: &Invocation,
    rank: usize,
    distributed: &DistributedConfig,
    rendezvous: SocketAddr,
) -> Invocation {
    let mut invocation = base.clone();
    invocation.rank = rank;
    let env = &mut invocation.env;
    env.insert("RANK".to_string(), rank.to_string());
    env.insert("LOCAL_RANK".to_string(), rank.to_string());
    env.insert(
        "WORLD_SIZE".to_string(),
        distributed.processes_per_worker.to_string(),
    );
    env.insert("MASTER_ADDR".to_string(), MASTER_ADDR.to_string());
    env.insert(
        "MASTER_PORT".to_string(),
        distributed.master_port.to_string(),
    );
    env.insert(RENDEZVOUS_ENV.to_string(), rendezvous.to_string());
    invocation
}

/// Runs `processes_per_worker` ranks of the same task behind a startup
/// barrier.
///
/// The attempt fails with `RendezvousTimeout` if the ranks do not all check in
/// within the startup window, and with the first failing rank's exit code
/// otherwise. Either way the surviving ranks are killed.
pub async fn run_fan_out(
    base: &Invocation,
    distributed: &DistributedConfig,
    executable: Arc<dyn TrainingExecutable>,
) -> Result<ExitState, SweepError> {
    let world_size = distributed.processes_per_worker;
    let barrier = RendezvousBarrier::bind(distributed.barrier_endpoint(), world_size)
        .await
        .map_err(|source| SweepError::Launch {
            program: format!("rendezvous barrier on {}", distributed.barrier_endpoint()),
            source,
        })?;
    let rendezvous = barrier.local_addr().map_err(|source| SweepError::Launch {
        program: "rendezvous barrier".to_string(),
        source,
    })?;

    info!(
        component = "bootstrap",
        world_size,
        %rendezvous,
        master_port = distributed.master_port,
        "rendezvous_started"
    );

    let mut ranks = JoinSet::new();
    for rank in 0..world_size {
        let invocation = rank_invocation(base, rank, distributed, rendezvous);
        let executable = Arc::clone(&executable);
        ranks.spawn(async move { (rank, executable.run(invocation).await) });
    }

    let barrier_wait = barrier.wait(distributed.startup_timeout());
    tokio::pin!(barrier_wait);

    loop {
        tokio::select! {
            released = &mut barrier_wait => match released {
                Ok(()) => {
                    info!(component = "bootstrap", world_size, "rendezvous_released");
                    break;
                }
                Err(SweepError::RendezvousTimeout { arrived, expected }) => {
                    ranks.abort_all();
                    warn!(
                        component = "bootstrap",
                        arrived,
                        expected,
                        startup_timeout_secs = distributed.startup_timeout_secs,
                        "rendezvous_timeout"
                    );
                    return Ok(ExitState::RendezvousTimeout { arrived, expected });
                }
                Err(other) => {
                    ranks.abort_all();
                    return Err(other);
                }
            },
            Some(joined) = ranks.join_next() => {
                if let Some(failure) = rank_failure(joined)? {
                    ranks.abort_all();
                    return Ok(failure);
                }
            }
        }
    }

    while let Some(joined) = ranks.join_next().await {
        if let Some(failure) = rank_failure(joined)? {
            ranks.abort_all();
            return Ok(failure);
        }
    }
    Ok(ExitState::Succeeded)
}

fn rank_failure(
    joined: Result<(usize, Result<ProcessExit, SweepError>), tokio::task::JoinError>,
) -> Result<Option<ExitState>, SweepError> {
    let (rank, result) =
        joined.map_err(|join_error| SweepError::WorkerAborted(join_error.to_string()))?;
    let exit = result?;
    if exit.success() {
        return Ok(None);
    }
    error!(component = "bootstrap", rank, code = ?exit.code, "rank_failed");
    Ok(Some(ExitState::ExecutableFailure { code: exit.code }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::adapters::rendezvous::check_in;
    use crate::config::LogCapture;

    /// Checks in with the barrier like a wrapped training script would, then
    /// exits with the configured code.
    struct CheckingInExecutable {
        absent_rank: Option<usize>,
        failing_rank: Option<(usize, i32)>,
    }

    #[async_trait]
    impl TrainingExecutable for CheckingInExecutable {
        async fn run(&self, invocation: Invocation) -> Result<ProcessExit, SweepError> {
            let rank = invocation.rank;
            if self.absent_rank == Some(rank) {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return Ok(ProcessExit { code: Some(0) });
            }
            let endpoint: SocketAddr = invocation.env[RENDEZVOUS_ENV]
                .parse()
                .expect("rendezvous endpoint");
            if let Some((failing, code)) = self.failing_rank {
                if failing == rank {
                    return Ok(ProcessExit { code: Some(code) });
                }
            }
            check_in(endpoint, rank, Duration::from_secs(5))
                .await
                .map_err(|source| SweepError::Launch {
                    program: invocation.program.clone(),
                    source,
                })?;
            Ok(ProcessExit { code: Some(0) })
        }
    }

    fn base_invocation() -> Invocation {
        Invocation {
            program: "trainer".to_string(),
            args: vec!["--lr".to_string(), "0.1".to_string()],
            env: BTreeMap::new(),
            working_dir: PathBuf::from("/tmp/workspace"),
            log_capture: LogCapture::Inherit,
            rank: 0,
        }
    }

    fn distributed(processes_per_worker: usize, startup_timeout_secs: u64) -> DistributedConfig {
        DistributedConfig {
            processes_per_worker,
            master_port: 29500,
            barrier_port: 0,
            startup_timeout_secs,
        }
    }

    #[test]
    fn rank_invocation_sets_collective_environment() {
        let endpoint: SocketAddr = "127.0.0.1:41000".parse().expect("endpoint");
        let invocation = rank_invocation(&base_invocation(), 2, &distributed(4, 30), endpoint);

        assert_eq!(invocation.rank, 2);
        assert_eq!(invocation.env["RANK"], "2");
        assert_eq!(invocation.env["LOCAL_RANK"], "2");
        assert_eq!(invocation.env["WORLD_SIZE"], "4");
        assert_eq!(invocation.env["MASTER_ADDR"], "127.0.0.1");
        assert_eq!(invocation.env["MASTER_PORT"], "29500");
        assert_eq!(invocation.env[RENDEZVOUS_ENV], "127.0.0.1:41000");
        assert_eq!(invocation.args, base_invocation().args);
    }

    #[tokio::test]
    async fn all_ranks_checking_in_succeeds() {
        let executable = Arc::new(CheckingInExecutable {
            absent_rank: None,
            failing_rank: None,
        });

        let state = run_fan_out(&base_invocation(), &distributed(3, 5), executable)
            .await
            .expect("fan-out should run");

        assert_eq!(state, ExitState::Succeeded);
    }

    #[tokio::test]
    async fn missing_rank_times_out_the_rendezvous() {
        let executable = Arc::new(CheckingInExecutable {
            absent_rank: Some(1),
            failing_rank: None,
        });

        let state = run_fan_out(&base_invocation(), &distributed(2, 1), executable)
            .await
            .expect("fan-out should run");

        assert_eq!(
            state,
            ExitState::RendezvousTimeout {
                arrived: 1,
                expected: 2
            }
        );
    }

    #[tokio::test]
    async fn early_rank_failure_stops_the_attempt() {
        let executable = Arc::new(CheckingInExecutable {
            absent_rank: None,
            failing_rank: Some((0, 7)),
        });

        let state = run_fan_out(&base_invocation(), &distributed(2, 5), executable)
            .await
            .expect("fan-out should run");

        assert_eq!(state, ExitState::ExecutableFailure { code: Some(7) });
    }
}
