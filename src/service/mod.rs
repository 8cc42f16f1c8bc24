//! Service Surface
//!
//! The transport-agnostic request/response contract exposed to callers.

pub mod facade;

pub use facade::{
    ClusterStatusResponse, CompactionRunResponse, ConfigureCompactionRequest,
    ConfigureCompactionResponse, DeleteResponse, GetResponse, HistoryEntry, HistoryResponse,
    KeysResponse, KvService, PutRequest, PutResponse, RequestStatusResponse, SegmentsResponse,
    ServiceError, VersionsResponse,
};
