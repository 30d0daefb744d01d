//! Blocking collective operations across training participants.
//!
//! Every participant must issue the same sequence of calls with buffers of
//! the same length. The trainer only talks to [`Communicator`]; which backend
//! sits behind it is decided once at startup.

use std::{
    env,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::TrainingError;

pub trait Communicator: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Sum-reduce across all participants, in place.
    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<(), TrainingError>;

    /// Sum-reduce into `root`. Other participants keep their input.
    fn reduce_sum(&self, data: &mut [f32], root: usize) -> Result<(), TrainingError>;

    /// Copy `root`'s buffer to every participant.
    fn broadcast(&self, data: &mut [f32], root: usize) -> Result<(), TrainingError>;

    fn barrier(&self) -> Result<(), TrainingError>;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

/// Sums one scalar across participants.
pub fn all_reduce_scalar(comm: &dyn Communicator, value: f64) -> Result<f64, TrainingError> {
    let mut buffer = [value as f32];
    comm.all_reduce_sum(&mut buffer)?;
    Ok(f64::from(buffer[0]))
}

/// True on every participant when any participant passes `true`.
pub fn all_agree_any(comm: &dyn Communicator, flag: bool) -> Result<bool, TrainingError> {
    let mut buffer = [if flag { 1.0 } else { 0.0 }];
    comm.all_reduce_sum(&mut buffer)?;
    Ok(buffer[0] > 0.0)
}

/// World of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _data: &mut [f32]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn reduce_sum(&self, _data: &mut [f32], root: usize) -> Result<(), TrainingError> {
        check_root(root, 1)
    }

    fn broadcast(&self, _data: &mut [f32], root: usize) -> Result<(), TrainingError> {
        check_root(root, 1)
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }
}

struct GroupState {
    world_size: usize,
    round: Mutex<Round>,
    changed: Condvar,
}

/// One rendezvous in progress. `completed` holds the contributions of the
/// last finished round and stays valid until every rank has arrived again.
struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Vec<f32>>,
    completed: Arc<Vec<Vec<f32>>>,
    departed: Option<usize>,
}

/// In-process collectives for participants running on separate threads.
///
/// Reductions add contributions in rank order, so every participant computes
/// bit-identical results. Dropping a participant's handle leaves the group:
/// peers blocked in an unfinished round, and every later call, fail with
/// [`TrainingError::Collective`] instead of waiting forever.
pub struct ThreadGroup {
    rank: usize,
    state: Arc<GroupState>,
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.state.world_size)
            .finish()
    }
}

impl ThreadGroup {
    /// One communicator per rank; hand element `r` to the thread running rank `r`.
    pub fn new(world_size: usize) -> Vec<ThreadGroup> {
        let world_size = world_size.max(1);
        let state = Arc::new(GroupState {
            world_size,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                slots: vec![Vec::new(); world_size],
                completed: Arc::new(Vec::new()),
                departed: None,
            }),
            changed: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                state: Arc::clone(&state),
            })
            .collect()
    }

    /// Blocks until every rank has contributed to the current round and
    /// returns all contributions in rank order.
    fn rendezvous(&self, data: &[f32]) -> Result<Arc<Vec<Vec<f32>>>, TrainingError> {
        let mut round = self.lock_round()?;
        if let Some(rank) = round.departed {
            return Err(peer_left(rank));
        }

        round.slots[self.rank] = data.to_vec();
        round.arrived += 1;
        let generation = round.generation;
        if round.arrived == self.state.world_size {
            let slots = std::mem::replace(
                &mut round.slots,
                vec![Vec::new(); self.state.world_size],
            );
            round.completed = Arc::new(slots);
            round.arrived = 0;
            round.generation += 1;
            self.state.changed.notify_all();
            return Ok(Arc::clone(&round.completed));
        }

        // The next round cannot finish without this rank, so `completed`
        // still belongs to our generation when we wake up.
        let round = self
            .state
            .changed
            .wait_while(round, |round| {
                round.generation == generation && round.departed.is_none()
            })
            .map_err(|_| poisoned())?;
        if round.generation != generation {
            return Ok(Arc::clone(&round.completed));
        }
        match round.departed {
            Some(rank) => Err(peer_left(rank)),
            None => Err(poisoned()),
        }
    }

    fn exchange(&self, data: &[f32]) -> Result<Arc<Vec<Vec<f32>>>, TrainingError> {
        let contributions = self.rendezvous(data)?;
        if let Some(bad) = contributions.iter().position(|c| c.len() != data.len()) {
            return Err(TrainingError::collective(format!(
                "rank {} contributed {} elements, rank {} expected {}",
                bad,
                contributions[bad].len(),
                self.rank,
                data.len()
            )));
        }
        Ok(contributions)
    }

    fn lock_round(&self) -> Result<MutexGuard<'_, Round>, TrainingError> {
        self.state.round.lock().map_err(|_| poisoned())
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        let mut round = self
            .state
            .round
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if round.departed.is_none() {
            round.departed = Some(self.rank);
        }
        self.state.changed.notify_all();
    }
}

impl Communicator for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.state.world_size
    }

    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<(), TrainingError> {
        let contributions = self.exchange(data)?;
        sum_in_rank_order(&contributions, data);
        Ok(())
    }

    fn reduce_sum(&self, data: &mut [f32], root: usize) -> Result<(), TrainingError> {
        check_root(root, self.state.world_size)?;
        let contributions = self.exchange(data)?;
        if self.rank == root {
            sum_in_rank_order(&contributions, data);
        }
        Ok(())
    }

    fn broadcast(&self, data: &mut [f32], root: usize) -> Result<(), TrainingError> {
        check_root(root, self.state.world_size)?;
        let contributions = self.exchange(data)?;
        data.copy_from_slice(&contributions[root]);
        Ok(())
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.rendezvous(&[]).map(|_| ())
    }
}

fn peer_left(rank: usize) -> TrainingError {
    TrainingError::collective(format!("rank {rank} left the group"))
}

fn poisoned() -> TrainingError {
    TrainingError::collective("collective state poisoned by a failed peer")
}

fn sum_in_rank_order(contributions: &[Vec<f32>], out: &mut [f32]) {
    out.fill(0.0);
    for contribution in contributions {
        for (acc, value) in out.iter_mut().zip(contribution) {
            *acc += *value;
        }
    }
}

fn check_root(root: usize, world_size: usize) -> Result<(), TrainingError> {
    if root >= world_size {
        return Err(TrainingError::collective(format!(
            "root rank {root} outside world of size {world_size}"
        )));
    }
    Ok(())
}

/// Rank assignment handed to this process by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedIdentity {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
}

impl DistributedIdentity {
    pub fn single() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }

    /// Reads `RANK`/`LOCAL_RANK`/`WORLD_SIZE`, falling back to the Open MPI
    /// variables, and to a single process when neither set is present.
    pub fn from_env() -> Result<Self, TrainingError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TrainingError> {
        let families = [
            ("RANK", "LOCAL_RANK", "WORLD_SIZE"),
            (
                "OMPI_COMM_WORLD_RANK",
                "OMPI_COMM_WORLD_LOCAL_RANK",
                "OMPI_COMM_WORLD_SIZE",
            ),
        ];
        for (rank_key, local_key, world_key) in families {
            let (Some(rank), Some(world)) = (lookup(rank_key), lookup(world_key)) else {
                continue;
            };
            let rank = parse_env(rank_key, &rank)?;
            let world_size = parse_env(world_key, &world)?;
            let local_rank = match lookup(local_key) {
                Some(value) => parse_env(local_key, &value)?,
                None => rank,
            };
            if world_size == 0 || rank >= world_size {
                return Err(TrainingError::initialization(format!(
                    "rank {rank} is not valid for world size {world_size}"
                )));
            }
            return Ok(Self {
                rank,
                local_rank,
                world_size,
            });
        }
        Ok(Self::single())
    }
}

fn parse_env(key: &str, value: &str) -> Result<usize, TrainingError> {
    value.trim().parse::<usize>().map_err(|err| {
        TrainingError::initialization(format!("environment variable {key}='{value}': {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;
    use std::time::Duration;

    fn run_group<F>(world: usize, body: F) -> Vec<Vec<f32>>
    where
        F: Fn(&ThreadGroup) -> Vec<f32> + Sync,
    {
        let groups = ThreadGroup::new(world);
        let body = &body;
        thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|group| scope.spawn(move || body(group)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_reduce_sums_every_rank() {
        let results = run_group(3, |group| {
            let mut data = vec![group.rank() as f32 + 1.0, 10.0];
            group.all_reduce_sum(&mut data).unwrap();
            data
        });
        for result in results {
            assert_eq!(result, vec![6.0, 30.0]);
        }
    }

    #[test]
    fn reduce_sum_only_updates_root() {
        let results = run_group(2, |group| {
            let mut data = vec![group.rank() as f32 + 1.0];
            group.reduce_sum(&mut data, 1).unwrap();
            data
        });
        assert_eq!(results, vec![vec![1.0], vec![3.0]]);
    }

    #[test]
    fn broadcast_copies_root() {
        let results = run_group(4, |group| {
            let mut data = vec![group.rank() as f32; 2];
            group.broadcast(&mut data, 2).unwrap();
            data
        });
        for result in results {
            assert_eq!(result, vec![2.0, 2.0]);
        }
    }

    #[test]
    fn repeated_rounds_do_not_mix() {
        let results = run_group(2, |group| {
            let mut totals = Vec::new();
            for round in 0..20 {
                let mut data = vec![(round * 10 + group.rank()) as f32];
                group.all_reduce_sum(&mut data).unwrap();
                totals.push(data[0]);
            }
            totals
        });
        let expected: Vec<f32> = (0..20).map(|round| (round * 20 + 1) as f32).collect();
        assert_eq!(results[0], expected);
        assert_eq!(results[1], expected);
    }

    #[test]
    fn any_flag_is_shared() {
        let results = run_group(3, |group| {
            vec![all_agree_any(group, group.rank() == 2).unwrap() as u8 as f32]
        });
        assert!(results.iter().all(|r| r[0] == 1.0));
    }

    #[test]
    fn mismatched_lengths_fail_everywhere() {
        let results = run_group(2, |group| {
            let mut data = vec![0.0; group.rank() + 1];
            vec![group.all_reduce_sum(&mut data).is_err() as u8 as f32]
        });
        assert!(results.iter().all(|r| r[0] == 1.0));
    }

    #[test]
    fn departed_peer_fails_waiting_rank() {
        let groups = ThreadGroup::new(2);
        let results: Vec<Result<(), TrainingError>> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    scope.spawn(move || {
                        if group.rank() == 1 {
                            thread::sleep(Duration::from_millis(50));
                            drop(group);
                            return Err(TrainingError::data("shard unreadable"));
                        }
                        let mut data = vec![1.0, 2.0];
                        group.all_reduce_sum(&mut data)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        match &results[0] {
            Err(TrainingError::Collective(message)) => assert!(message.contains("rank 1")),
            other => panic!("rank 0 should fail with a collective error, got {other:?}"),
        }
        assert!(matches!(results[1], Err(TrainingError::Data(_))));
    }

    #[test]
    fn calls_after_departure_fail_immediately() {
        let mut groups = ThreadGroup::new(3);
        drop(groups.remove(2));
        let mut data = [1.0];
        assert!(matches!(
            groups[0].all_reduce_sum(&mut data),
            Err(TrainingError::Collective(_))
        ));
        assert!(groups[1].barrier().is_err());
    }

    #[test]
    fn leaving_after_the_last_round_keeps_results() {
        let groups = ThreadGroup::new(2);
        let results: Vec<Vec<f32>> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    scope.spawn(move || {
                        let mut data = vec![group.rank() as f32 + 1.0];
                        group.all_reduce_sum(&mut data).unwrap();
                        group.barrier().unwrap();
                        data
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results, vec![vec![3.0], vec![3.0]]);
    }

    #[test]
    fn identity_prefers_torch_style_variables() {
        let vars: HashMap<&str, &str> = [
            ("RANK", "3"),
            ("WORLD_SIZE", "8"),
            ("LOCAL_RANK", "1"),
            ("OMPI_COMM_WORLD_RANK", "0"),
            ("OMPI_COMM_WORLD_SIZE", "2"),
        ]
        .into_iter()
        .collect();
        let identity =
            DistributedIdentity::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(
            identity,
            DistributedIdentity {
                rank: 3,
                local_rank: 1,
                world_size: 8
            }
        );
    }

    #[test]
    fn identity_falls_back_to_mpi_then_single() {
        let vars: HashMap<&str, &str> =
            [("OMPI_COMM_WORLD_RANK", "1"), ("OMPI_COMM_WORLD_SIZE", "2")]
                .into_iter()
                .collect();
        let identity =
            DistributedIdentity::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(identity.rank, 1);
        assert_eq!(identity.local_rank, 1);
        assert_eq!(identity.world_size, 2);

        let single = DistributedIdentity::from_lookup(|_| None).unwrap();
        assert_eq!(single, DistributedIdentity::single());
    }
}
