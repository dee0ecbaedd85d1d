//! Object and directory copy/move between resolved backend roots.
//!
//! Server-side primitives are used when source and target share a backend
//! that supports them; otherwise content is downloaded and re-uploaded.
//! Directory transfers merge the source's contents into the target.

use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::backend::{NodeInfo, RemoteBackend, join_rel};
use crate::error::BackendError;

/// How many bytes to pull per request on the fallback path.
const COPY_CHUNK: usize = 8 * 1024 * 1024;

fn same_backend(a: &Arc<dyn RemoteBackend>, b: &Arc<dyn RemoteBackend>) -> bool {
    Arc::ptr_eq(a, b)
}

async fn download(
    backend: &Arc<dyn RemoteBackend>,
    path: &str,
) -> Result<Bytes, BackendError> {
    let mut buf = Vec::new();
    loop {
        let chunk = backend
            .read_range(path, buf.len() as u64, COPY_CHUNK)
            .await?;
        if chunk.is_empty() {
            break;
        }
        buf.extend_from_slice(&chunk);
        if chunk.len() < COPY_CHUNK {
            break;
        }
    }
    Ok(Bytes::from(buf))
}

/// Copy one object. `existing_target` is the already-looked-up target node,
/// if any, so in-place overwrite semantics apply; a directory in the way is
/// rejected.
pub async fn copy_object(
    source: &Arc<dyn RemoteBackend>,
    source_path: &str,
    target: &Arc<dyn RemoteBackend>,
    target_path: &str,
    existing_target: Option<&NodeInfo>,
) -> Result<(), BackendError> {
    if let Some(existing) = existing_target {
        if existing.is_dir() {
            return Err(BackendError::IsDir);
        }
    }

    if same_backend(source, target) && source.supports_copy() {
        return source.copy_within(source_path, target_path).await;
    }

    debug!(
        "{} -> {}: no server-side copy, falling back to transfer",
        source.remote(),
        target.remote()
    );
    let data = download(source, source_path).await?;
    target.put(target_path, data).await
}

/// Move one object; the source is gone afterwards.
pub async fn move_object(
    source: &Arc<dyn RemoteBackend>,
    source_path: &str,
    target: &Arc<dyn RemoteBackend>,
    target_path: &str,
    existing_target: Option<&NodeInfo>,
) -> Result<(), BackendError> {
    if let Some(existing) = existing_target {
        if existing.is_dir() {
            return Err(BackendError::IsDir);
        }
    }

    if same_backend(source, target) && source.supports_move() {
        if existing_target.is_some() {
            // Overwrite via replace: remove the stale target first so the
            // rename cannot trip over it.
            target.remove_file(target_path).await?;
        }
        return source.rename(source_path, target_path).await;
    }

    copy_object(source, source_path, target, target_path, existing_target).await?;
    source.remove_file(source_path).await
}

/// Copy the contents of `source_path` into `target_path`, creating target
/// directories as needed. The source directory itself does not become a
/// child of the target.
pub async fn copy_dir(
    source: &Arc<dyn RemoteBackend>,
    source_path: &str,
    target: &Arc<dyn RemoteBackend>,
    target_path: &str,
) -> Result<(), BackendError> {
    transfer_dir(source, source_path, target, target_path, false).await
}

/// Move the contents of `source_path` into `target_path`.
///
/// Emptied source subdirectories are removed as the walk unwinds, but the
/// source root itself is left for the caller, mirroring the backend
/// primitive's behavior when the target already exists.
pub async fn move_dir(
    source: &Arc<dyn RemoteBackend>,
    source_path: &str,
    target: &Arc<dyn RemoteBackend>,
    target_path: &str,
) -> Result<(), BackendError> {
    transfer_dir(source, source_path, target, target_path, true).await
}

async fn transfer_dir(
    source: &Arc<dyn RemoteBackend>,
    source_path: &str,
    target: &Arc<dyn RemoteBackend>,
    target_path: &str,
    remove_source: bool,
) -> Result<(), BackendError> {
    if !source.stat(source_path).await?.is_dir() {
        return Err(BackendError::IsFile);
    }
    match target.stat(target_path).await {
        Ok(info) if !info.is_dir() => return Err(BackendError::IsFile),
        Ok(_) => {}
        Err(err) if err.is_not_found() => {
            if !target_path.is_empty() {
                target.mkdir(target_path, 0o755).await?;
            }
        }
        Err(err) => return Err(err),
    }

    // Iterative walk; directories are recorded so emptied source dirs can
    // be removed deepest-first after their contents moved.
    let mut pending = vec![(source_path.to_string(), target_path.to_string())];
    let mut visited_dirs = Vec::new();

    while let Some((src_dir, dst_dir)) = pending.pop() {
        for entry in source.list(&src_dir).await? {
            let src_child = join_rel(&src_dir, &entry.name);
            let dst_child = join_rel(&dst_dir, &entry.name);

            if entry.is_dir() {
                match target.stat(&dst_child).await {
                    Ok(info) if !info.is_dir() => return Err(BackendError::IsFile),
                    Ok(_) => {}
                    Err(err) if err.is_not_found() => {
                        target.mkdir(&dst_child, entry.perms).await?;
                    }
                    Err(err) => return Err(err),
                }
                pending.push((src_child, dst_child));
            } else {
                let existing = match target.stat(&dst_child).await {
                    Ok(info) => Some(info),
                    Err(err) if err.is_not_found() => None,
                    Err(err) => return Err(err),
                };
                if remove_source {
                    move_object(source, &src_child, target, &dst_child, existing.as_ref())
                        .await?;
                } else {
                    copy_object(source, &src_child, target, &dst_child, existing.as_ref())
                        .await?;
                }
            }
        }

        if remove_source && src_dir != source_path {
            visited_dirs.push(src_dir);
        }
    }

    if remove_source {
        // Deepest paths sort last; delete in reverse so children go first.
        visited_dirs.sort();
        for dir in visited_dirs.into_iter().rev() {
            source.rmdir(&dir).await?;
        }
    }

    Ok(())
}
