pub mod accept_chunks;
pub mod chunk_work;
pub mod payment_status;
pub mod start_session;

pub use accept_chunks::{
    AcceptChunkBatchOperation, AcceptChunkBatchOperationRequest, AcceptChunkBatchOperationResult,
    AcceptedChunk, ChunkUpload, IngestionQueue, IngestionStatsSnapshot,
};
pub use chunk_work::{
    AssignFileIdentifierOperation, AssignFileIdentifierOperationRequest, ClaimChunkWorkOperation,
    ClaimChunkWorkOperationRequest, ClaimChunkWorkOperationResult, CompleteChunkWorkOperation,
    CompleteChunkWorkOperationRequest,
};
pub use payment_status::{
    CheckPaymentStatusOperation, CheckPaymentStatusOperationRequest,
    CheckPaymentStatusOperationResult,
};
pub use start_session::{
    Invoice, SecondarySessionRef, StartPairedSessionOperation, StartPairedSessionOperationRequest,
    StartPairedSessionOperationResult, StartSecondarySessionOperation,
};
