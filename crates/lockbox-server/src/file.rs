use std::io::Read;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::content::{account_path, FileContentStore};
use crate::pb::file_server::File;
use crate::pb::{
    create_file_request, CreateFileRequest, CreateFileResponse, DeleteFileRequest,
    DeleteFileResponse, DownloadFileRequest, DownloadFileResponse, FileInfo, GetFileInfoRequest,
    GetFileInfoResponse, ListFilesRequest, ListFilesResponse, Metadata, UpdateFileNameRequest,
    UpdateFileNameResponse,
};
use crate::store::{Account, CreateFileParams, FileRecord, Store, StoreError, TxOutcome};
use crate::{account_from_metadata, log_status};

/// Bytes per message on a download stream.
const DOWNLOAD_CHUNK_SIZE: usize = 1024;

/// Chunked upload with two-phase create, download streaming, rename, listing
/// and soft delete. Physical cleanup of tombstoned rows belongs to the sweep
/// in [`crate::gc`].
pub struct FileService {
    store: Arc<dyn Store>,
    content: Arc<dyn FileContentStore>,
    max_file_size: u64,
}

impl FileService {
    pub fn new(
        store: Arc<dyn Store>,
        content: Arc<dyn FileContentStore>,
        max_file_size: u64,
    ) -> Self {
        Self {
            store,
            content,
            max_file_size,
        }
    }

    fn get_status(e: StoreError) -> Status {
        match e {
            StoreError::NotFound => Status::not_found("cannot find file"),
            other => Status::internal(format!("cannot get file: {other}")),
        }
    }

    fn info_for(&self, record: FileRecord) -> Result<FileInfo, Status> {
        let pairs = self.store.list_file_metadata(record.id).map_err(|e| {
            log_status(Status::internal(format!(
                "cannot collect file metadata: {e}"
            )))
        })?;
        let metadata = pairs
            .into_iter()
            .map(|p| Metadata {
                key: p.key,
                value: p.value,
            })
            .collect();
        Ok(file_info(record, metadata))
    }

    /// Upload body shared by the tonic handler and the tests: `stream` yields
    /// the chunk messages that follow the already-consumed info message.
    ///
    /// The file row is inserted inside a transaction held open on a blocking
    /// task; the task parks on a per-request oneshot until the buffered
    /// content has been written (commit) or anything went wrong (rollback).
    /// Every exit path below resolves the handoff exactly once, so the
    /// transaction task is never left parked.
    async fn handle_create<S>(&self, account: &Account, info: FileInfo, mut stream: S) -> Result<FileInfo, Status>
    where
        S: Stream<Item = Result<CreateFileRequest, Status>> + Unpin,
    {
        // A taken triple fails before any chunk is consumed.
        match self
            .store
            .get_file(account.id, &info.filename, &info.filepath)
        {
            Ok(_) => return Err(log_status(Status::already_exists("file already exists"))),
            Err(StoreError::NotFound) => {}
            Err(e) => {
                return Err(log_status(Status::internal(format!(
                    "cannot check file: {e}"
                ))))
            }
        }

        let (signal, outcome) = oneshot::channel();
        let params = CreateFileParams {
            account_id: account.id,
            filename: info.filename.clone(),
            filepath: info.filepath.clone(),
        };
        let store = self.store.clone();
        let tx_task = tokio::task::spawn_blocking(move || store.create_file_tx(params, outcome));

        let buffer = match self.receive_chunks(&mut stream).await {
            Ok(buffer) => buffer,
            Err(status) => {
                let _ = signal.send(TxOutcome::Rollback);
                let _ = tx_task.await;
                return Err(log_status(status));
            }
        };

        // A concurrent create can win the triple while chunks are in flight;
        // the transaction task has then already failed. Don't write content
        // for a doomed row.
        if tx_task.is_finished() {
            let _ = signal.send(TxOutcome::Rollback);
            return Err(log_status(tx_error(tx_task.await)));
        }

        let path = account_path(&account.username, &info.filepath);
        if let Err(e) = self.content.save(&info.filename, &path, &buffer) {
            let _ = signal.send(TxOutcome::Rollback);
            let _ = tx_task.await;
            return Err(log_status(Status::internal(format!(
                "cannot save file content: {e}"
            ))));
        }

        // Content is durable; let the row follow.
        let filesize = buffer.len() as u64;
        let _ = signal.send(TxOutcome::Commit { filesize });
        let record = match tx_task.await {
            Ok(Ok(record)) => record,
            other => {
                // The row never committed; take the content back out so the
                // failed create leaves nothing behind.
                if let Err(e) = self.content.delete(&info.filename, &path) {
                    warn!(error = %e, filename = %info.filename, "could not remove content of failed create");
                }
                return Err(log_status(tx_error(other)));
            }
        };

        for md in &info.metadata {
            self.store
                .upsert_file_metadata(record.id, &md.key, &md.value)
                .map_err(|e| {
                    log_status(Status::internal(format!(
                        "failed to create file metadata: {e}"
                    )))
                })?;
        }

        Ok(file_info(record, info.metadata))
    }

    /// Accumulate chunk messages until the client half-closes the stream,
    /// enforcing the configured size cap. Transport cancellation and deadline
    /// expiry surface as the stream's error status and pass through.
    async fn receive_chunks<S>(&self, stream: &mut S) -> Result<Vec<u8>, Status>
    where
        S: Stream<Item = Result<CreateFileRequest, Status>> + Unpin,
    {
        let mut buffer = Vec::new();
        while let Some(message) = stream.next().await {
            let chunk = match message?.data {
                Some(create_file_request::Data::Chunk(chunk)) => chunk,
                _ => {
                    return Err(Status::invalid_argument(
                        "stream may carry only one file info message",
                    ))
                }
            };
            if (buffer.len() + chunk.len()) as u64 > self.max_file_size {
                return Err(Status::invalid_argument(format!(
                    "file size exceeds the limit of {} bytes",
                    self.max_file_size
                )));
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

fn file_info(record: FileRecord, metadata: Vec<Metadata>) -> FileInfo {
    FileInfo {
        filename: record.filename,
        filepath: record.filepath,
        size: record.filesize,
        metadata,
        created_at: record.created_at,
    }
}

/// Map the resolution of the transaction task to a caller-facing status.
fn tx_error(result: Result<Result<FileRecord, StoreError>, JoinError>) -> Status {
    match result {
        Ok(Err(StoreError::AlreadyExists)) => Status::already_exists("file already exists"),
        Ok(Err(e)) => Status::internal(format!("cannot create file: {e}")),
        Ok(Ok(_)) => Status::internal("file transaction resolved unexpectedly"),
        Err(e) => Status::internal(format!("file transaction task failed: {e}")),
    }
}

#[tonic::async_trait]
impl File for FileService {
    async fn create_file(
        &self,
        request: Request<Streaming<CreateFileRequest>>,
    ) -> Result<Response<CreateFileResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let mut stream = request.into_inner();

        let info = match stream.next().await {
            Some(Ok(CreateFileRequest {
                data: Some(create_file_request::Data::Info(info)),
            })) => info,
            Some(Ok(_)) => {
                return Err(log_status(Status::invalid_argument(
                    "first message must carry the file info",
                )))
            }
            Some(Err(status)) => return Err(log_status(status)),
            None => {
                return Err(log_status(Status::invalid_argument(
                    "create file stream is empty",
                )))
            }
        };
        info!(
            username = %account.username,
            filename = %info.filename,
            filepath = %info.filepath,
            "create file request"
        );

        let info = self.handle_create(&account, info, stream).await?;
        Ok(Response::new(CreateFileResponse { info: Some(info) }))
    }

    type DownloadFileStream = ReceiverStream<Result<DownloadFileResponse, Status>>;

    async fn download_file(
        &self,
        request: Request<DownloadFileRequest>,
    ) -> Result<Response<Self::DownloadFileStream>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let req = request.into_inner();
        info!(username = %account.username, filename = %req.filename, "download file request");

        // Tombstoned rows are as absent as unknown ones.
        self.store
            .get_file(account.id, &req.filename, &req.filepath)
            .map_err(|e| log_status(Self::get_status(e)))?;

        let path = account_path(&account.username, &req.filepath);
        let mut reader = self.content.load(&req.filename, &path).map_err(|e| {
            log_status(Status::internal(format!("cannot load file content: {e}")))
        })?;

        let (tx, rx) = mpsc::channel(16);
        tokio::task::spawn_blocking(move || {
            let mut chunk = [0u8; DOWNLOAD_CHUNK_SIZE];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let response = DownloadFileResponse {
                            chunk: chunk[..n].to_vec(),
                            bytes_sent: n as u32,
                        };
                        // A send error means the client went away; stop reading.
                        if tx.blocking_send(Ok(response)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let status = Status::internal(format!("cannot read file content: {e}"));
                        let _ = tx.blocking_send(Err(log_status(status)));
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_file_info(
        &self,
        request: Request<GetFileInfoRequest>,
    ) -> Result<Response<GetFileInfoResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let req = request.into_inner();
        info!(username = %account.username, filename = %req.filename, "get file info request");

        let record = self
            .store
            .get_file(account.id, &req.filename, &req.filepath)
            .map_err(|e| log_status(Self::get_status(e)))?;

        Ok(Response::new(GetFileInfoResponse {
            info: Some(self.info_for(record)?),
        }))
    }

    async fn list_files(
        &self,
        request: Request<ListFilesRequest>,
    ) -> Result<Response<ListFilesResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        info!(username = %account.username, "list files request");

        let records = self
            .store
            .list_files(account.id)
            .map_err(|e| log_status(Status::internal(format!("cannot get files: {e}"))))?;

        let mut info = Vec::with_capacity(records.len());
        for record in records {
            info.push(self.info_for(record)?);
        }
        Ok(Response::new(ListFilesResponse { info }))
    }

    async fn update_file_name(
        &self,
        request: Request<UpdateFileNameRequest>,
    ) -> Result<Response<UpdateFileNameResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let req = request.into_inner();
        info!(
            username = %account.username,
            filename = %req.filename,
            new_filename = %req.new_filename,
            "update file name request"
        );

        self.store
            .get_file(account.id, &req.filename, &req.filepath)
            .map_err(|e| log_status(Self::get_status(e)))?;
        if self
            .store
            .get_file(account.id, &req.new_filename, &req.filepath)
            .is_ok()
        {
            return Err(log_status(Status::already_exists(
                "a file with the new name already exists",
            )));
        }

        let path = account_path(&account.username, &req.filepath);
        self.content
            .rename(&req.filename, &req.new_filename, &path)
            .map_err(|e| {
                log_status(Status::internal(format!("cannot rename file content: {e}")))
            })?;

        let record = match self.store.update_file_name(
            account.id,
            &req.filename,
            &req.filepath,
            &req.new_filename,
        ) {
            Ok(record) => record,
            // Content already moved; the row did not follow. Surface the
            // divergence instead of guessing a repair.
            Err(e) => {
                return Err(log_status(Status::internal(format!(
                    "content renamed to {} but the row rename failed: {e}",
                    req.new_filename
                ))))
            }
        };

        for md in &req.metadata {
            self.store
                .upsert_file_metadata(record.id, &md.key, &md.value)
                .map_err(|e| {
                    log_status(Status::internal(format!(
                        "failed to update file metadata: {e}"
                    )))
                })?;
        }

        Ok(Response::new(UpdateFileNameResponse {
            info: Some(self.info_for(record)?),
        }))
    }

    async fn delete_file(
        &self,
        request: Request<DeleteFileRequest>,
    ) -> Result<Response<DeleteFileResponse>, Status> {
        let account = account_from_metadata(self.store.as_ref(), request.metadata())?;
        let req = request.into_inner();
        info!(username = %account.username, filename = %req.filename, "delete file request");

        // Tombstone only: content and metadata wait for the sweep.
        self.store
            .delete_file(account.id, &req.filename, &req.filepath)
            .map_err(|e| {
                log_status(match e {
                    StoreError::NotFound => Status::not_found("cannot find file"),
                    other => Status::internal(format!("cannot delete file: {other}")),
                })
            })?;

        Ok(Response::new(DeleteFileResponse {
            filename: req.filename,
            filepath: req.filepath,
        }))
    }
}
