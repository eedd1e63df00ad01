//! Wire schema for the Tidepool object-store service.
//!
//! Request/response message types exchanged between clients and the
//! store's RPC layer: object put/get/remove, replica listing, and
//! segment mount bookkeeping. The memory engine does not parse or emit
//! these; they define the boundary the engine's collaborators speak.
//!
//! Every response carries a `status_code` whose values are assigned by
//! the service, not by this crate.

use serde::{Deserialize, Serialize};

/// State of one registered buffer within a replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufStatus {
    Init,
    Complete,
    Failed,
    Unregistered,
}

/// One buffer backing part of a replica, addressed inside a mounted
/// segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufHandle {
    pub segment_name: String,
    pub size: u64,
    /// Address of the buffer within the mounted segment.
    pub buffer: u64,
    pub status: BufStatus,
}

/// Lifecycle of a whole replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Undefined,
    Initialized,
    Processing,
    Complete,
    Removed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub handles: Vec<BufHandle>,
    pub status: ReplicaStatus,
}

/// Replication settings for a put.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateConfig {
    pub replica_num: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistKeyRequest {
    pub key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistKeyResponse {
    pub status_code: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReplicaListRequest {
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReplicaListResponse {
    pub status_code: i32,
    pub replica_list: Vec<ReplicaInfo>,
}

/// Opens a put: the service allocates buffers for each slice and returns
/// the replica layout the client writes into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutStartRequest {
    pub key: String,
    pub value_length: u64,
    pub config: ReplicateConfig,
    pub slice_lengths: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutStartResponse {
    pub status_code: i32,
    pub replica_list: Vec<ReplicaInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutEndRequest {
    pub key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutEndResponse {
    pub status_code: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRevokeRequest {
    pub key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRevokeResponse {
    pub status_code: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub status_code: i32,
}

/// Registers a contiguous memory segment with the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSegmentRequest {
    pub buffer: u64,
    pub size: u64,
    pub segment_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSegmentResponse {
    pub status_code: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountSegmentRequest {
    pub segment_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountSegmentResponse {
    pub status_code: i32,
}
