use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ndarray::{Array, Axis, RemoveAxis};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::error::{AdmmError, PartitionError};
use crate::partition::{chunk_of, combine_along, split_along};

/// Rank of the coordinating process.
pub const ROOT: usize = 0;

/// Axis along which ptychography-domain arrays `(T, Z, Y)` are partitioned (views).
pub const PTYCHO_AXIS: Axis = Axis(0);

/// Axis along which tomography-domain arrays `(T, Z, Y)` are partitioned (rows of the object).
pub const TOMO_AXIS: Axis = Axis(1);

// Shared by the wire format and the on-disk exports.
pub(crate) const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard()
    .with_little_endian()
    .with_variable_int_encoding();

/// Values that can cross a process boundary.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Array element types that can be partitioned and sent.
pub trait Element: Payload + Clone {}

impl<T> Element for T where T: Payload + Clone {}

/// Array dimensionalities that can be split along an axis and sent.
pub trait Layout: RemoveAxis + Serialize + DeserializeOwned {}

impl<D> Layout for D where D: RemoveAxis + Serialize + DeserializeOwned {}

/// Kinds of collective call, carried on the wire so that mismatched calls are caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collective {
    Scatter,
    Broadcast,
    AllGather,
}

/// Reason the coordinating process refused to deliver a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Abort {
    Partition(PartitionError),
    MissingRootValue(Collective),
}

impl From<Abort> for AdmmError {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Partition(e) => AdmmError::Partition(e),
            Abort::MissingRootValue(collective) => AdmmError::MissingRootValue(collective),
        }
    }
}

/// What the root sends for rooted collectives: the value, or the reason every rank must stop.
pub type Parcel<T> = Result<T, Abort>;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, AdmmError> {
    Ok(bincode::serde::encode_to_vec(value, BINCODE_CONFIG)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AdmmError> {
    let (value, _): (T, _) = bincode::serde::decode_from_slice(bytes, BINCODE_CONFIG)?;
    Ok(value)
}

/// Channel through which partitioned state crosses process boundaries.
///
/// Every operation except the topology queries is a collective: all ranks of the
/// group must make the same sequence of calls, in the same order, with no
/// data-dependent branching around them. A rank that skips or reorders a call
/// leaves its peers blocked forever. This is a liveness contract of the design;
/// transports are not required to detect it.
///
/// Ptychography-domain arrays are partitioned along [`PTYCHO_AXIS`], tomography-domain
/// arrays along [`TOMO_AXIS`]. Chunks follow the rule of
/// [`chunk_bounds`](crate::partition::chunk_bounds).
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Rank of this process within the group.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == ROOT
    }

    /// Replicates the root's value to every rank. Values passed by other ranks are ignored.
    async fn broadcast<T: Payload>(&self, value: Option<T>) -> Result<T, AdmmError>;

    /// Splits the root's array along its leading axis and hands chunk `r` to rank `r`.
    ///
    /// Fails on every rank with `PartitionError` when the leading axis is shorter
    /// than the group.
    async fn scatter<A: Element, D: Layout>(
        &self,
        global: Option<Array<A, D>>,
    ) -> Result<Array<A, D>, AdmmError>;

    /// Concatenates every rank's partition along `axis`, in rank order, on every rank.
    async fn all_gather<A: Element, D: Layout>(
        &self,
        local: &Array<A, D>,
        axis: Axis,
    ) -> Result<Array<A, D>, AdmmError>;

    /// Re-slices a tomography partition (split by rows) into this rank's
    /// ptychography partition (split by views).
    async fn get_ptycho_slice<A: Element, D: Layout>(
        &self,
        arg: &Array<A, D>,
    ) -> Result<Array<A, D>, AdmmError> {
        let whole = self.all_gather(arg, TOMO_AXIS).await?;
        Ok(chunk_of(whole.view(), PTYCHO_AXIS, self.size(), self.rank())?)
    }

    /// Re-slices a ptychography partition (split by views) into this rank's
    /// tomography partition (split by rows).
    async fn get_tomo_slice<A: Element, D: Layout>(
        &self,
        arg: &Array<A, D>,
    ) -> Result<Array<A, D>, AdmmError> {
        let whole = self.all_gather(arg, PTYCHO_AXIS).await?;
        Ok(chunk_of(whole.view(), TOMO_AXIS, self.size(), self.rank())?)
    }
}

#[derive(Debug)]
struct Envelope {
    source: usize,
    sequence: u64,
    collective: Collective,
    payload: Vec<u8>,
}

struct Inbox {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    /// Envelopes that arrived before this rank asked for them.
    parked: HashMap<(usize, u64), Envelope>,
}

/// In-process transport: every rank is a task holding one `LocalCommunicator`.
///
/// Messages are bincode-encoded and travel over unbounded channels, so sends never
/// block and only receives wait. Each collective call draws the next sequence number;
/// lock-step execution keeps the numbers identical on every rank.
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    /// Senders to every rank, `None` at this rank's own index
    peers: Vec<Option<mpsc::UnboundedSender<Envelope>>>,
    inbox: Mutex<Inbox>,
    sequence: AtomicU64,
}

impl LocalCommunicator {
    /// Builds a fully connected group of `size` communicators, indexed by rank.
    pub fn group(size: usize) -> Vec<LocalCommunicator> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel::<Envelope>()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| LocalCommunicator {
                rank,
                size,
                peers: senders
                    .iter()
                    .enumerate()
                    .map(|(dest, sender)| (dest != rank).then(|| sender.clone()))
                    .collect(),
                inbox: Mutex::new(Inbox {
                    receiver,
                    parked: HashMap::new(),
                }),
                sequence: AtomicU64::new(0),
            })
            .collect()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn send(
        &self,
        dest: usize,
        sequence: u64,
        collective: Collective,
        payload: Vec<u8>,
    ) -> Result<(), AdmmError> {
        log::trace!(
            "[Communicator] rank {} {:?} #{}: {} bytes to rank {}",
            self.rank,
            collective,
            sequence,
            payload.len(),
            dest
        );
        let sender = self.peers[dest]
            .as_ref()
            .ok_or(AdmmError::Disconnected { rank: self.rank })?;
        sender
            .send(Envelope {
                source: self.rank,
                sequence,
                collective,
                payload,
            })
            .map_err(|_| AdmmError::Disconnected { rank: self.rank })
    }

    async fn receive(
        &self,
        source: usize,
        sequence: u64,
        expected: Collective,
    ) -> Result<Vec<u8>, AdmmError> {
        let mut inbox = self.inbox.lock().await;
        let envelope = match inbox.parked.remove(&(source, sequence)) {
            Some(envelope) => envelope,
            None => loop {
                let envelope = inbox
                    .receiver
                    .recv()
                    .await
                    .ok_or(AdmmError::Disconnected { rank: self.rank })?;
                if envelope.source == source && envelope.sequence == sequence {
                    break envelope;
                }
                inbox
                    .parked
                    .insert((envelope.source, envelope.sequence), envelope);
            },
        };

        if envelope.collective != expected {
            return Err(AdmmError::CollectiveMismatch {
                rank: self.rank,
                source_rank: source,
                sequence,
                expected,
                received: envelope.collective,
            });
        }
        Ok(envelope.payload)
    }

    fn send_to_peers(
        &self,
        sequence: u64,
        collective: Collective,
        payload: &[u8],
    ) -> Result<(), AdmmError> {
        for dest in (0..self.size).filter(|&dest| dest != self.rank) {
            self.send(dest, sequence, collective, payload.to_vec())?;
        }
        Ok(())
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn broadcast<T: Payload>(&self, value: Option<T>) -> Result<T, AdmmError> {
        let sequence = self.next_sequence();
        let parcel: Parcel<T> = if self.is_root() {
            let parcel = value.ok_or(Abort::MissingRootValue(Collective::Broadcast));
            self.send_to_peers(sequence, Collective::Broadcast, &encode(&parcel)?)?;
            parcel
        } else {
            let bytes = self.receive(ROOT, sequence, Collective::Broadcast).await?;
            decode(&bytes)?
        };
        Ok(parcel?)
    }

    async fn scatter<A: Element, D: Layout>(
        &self,
        global: Option<Array<A, D>>,
    ) -> Result<Array<A, D>, AdmmError> {
        let sequence = self.next_sequence();
        if !self.is_root() {
            let bytes = self.receive(ROOT, sequence, Collective::Scatter).await?;
            let parcel: Parcel<Array<A, D>> = decode(&bytes)?;
            return Ok(parcel?);
        }

        let chunks = match global {
            None => Err(Abort::MissingRootValue(Collective::Scatter)),
            Some(global) => split_along(global.view(), Axis(0), self.size).map_err(Abort::Partition),
        };
        match chunks {
            Ok(chunks) => {
                let mut own = None;
                for (dest, chunk) in chunks.into_iter().enumerate() {
                    if dest == self.rank {
                        own = Some(chunk);
                    } else {
                        let parcel: Parcel<Array<A, D>> = Ok(chunk);
                        self.send(dest, sequence, Collective::Scatter, encode(&parcel)?)?;
                    }
                }
                own.ok_or(AdmmError::MissingRootValue(Collective::Scatter))
            }
            Err(abort) => {
                log::error!("[Communicator] rank {} aborting scatter: {:?}", self.rank, abort);
                let parcel: Parcel<Array<A, D>> = Err(abort.clone());
                self.send_to_peers(sequence, Collective::Scatter, &encode(&parcel)?)?;
                Err(abort.into())
            }
        }
    }

    async fn all_gather<A: Element, D: Layout>(
        &self,
        local: &Array<A, D>,
        axis: Axis,
    ) -> Result<Array<A, D>, AdmmError> {
        let sequence = self.next_sequence();
        self.send_to_peers(sequence, Collective::AllGather, &encode(local)?)?;

        let mut parts = Vec::with_capacity(self.size);
        for source in 0..self.size {
            if source == self.rank {
                parts.push(local.clone());
            } else {
                let bytes = self.receive(source, sequence, Collective::AllGather).await?;
                parts.push(decode(&bytes)?);
            }
        }
        Ok(combine_along(&parts, axis)?)
    }
}

/// Runs the same SPMD body on `size` in-process ranks and returns their results in rank order.
///
/// The first rank to fail tears the whole group down: remaining tasks are aborted
/// and that error is returned.
///
/// # Example
///
/// ```rust,no_run
/// # use ptadmm_core::comm::{launch, Communicator};
/// # async fn example() -> Result<(), ptadmm_core::error::AdmmError> {
/// let ranks = launch(4, |comm| async move { Ok::<_, ptadmm_core::error::AdmmError>(comm.rank()) }).await?;
/// assert_eq!(ranks, vec![0, 1, 2, 3]);
/// # Ok(())
/// # }
/// ```
pub async fn launch<F, Fut, R>(size: usize, body: F) -> Result<Vec<R>, AdmmError>
where
    F: Fn(LocalCommunicator) -> Fut,
    Fut: Future<Output = Result<R, AdmmError>> + Send + 'static,
    R: Send + 'static,
{
    let mut tasks = JoinSet::new();
    for comm in LocalCommunicator::group(size) {
        let rank = comm.rank();
        let rank_body = body(comm);
        tasks.spawn(async move { (rank, rank_body.await) });
    }

    let mut results: Vec<Option<R>> = (0..size).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (rank, result) = joined?;
        match result {
            Ok(value) => results[rank] = Some(value),
            Err(e) => {
                log::error!("[Communicator] rank {} failed, tearing down the group: {}", rank, e);
                tasks.abort_all();
                return Err(e);
            }
        }
    }
    Ok(results.into_iter().flatten().collect())
}
