//! Controller service
//!
//! Owns every write to the JivaVolume resources. Each mutating call takes
//! the per-volume lock for its volume id, reads the resource, drives the
//! backend and, where the backend converges asynchronously, waits on the
//! quorum reconciler before recording the new phase.

use super::types::{
    CapacityRange, ControllerCapability, ControllerExpandVolumeRequest,
    ControllerExpandVolumeResponse, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, CreateVolumeResponse,
    DeleteVolumeRequest, Empty, ListVolumesEntry, ListVolumesRequest, ListVolumesResponse,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, VolumeCapability,
    VolumeInfo, DEFAULT_CAPACITY_BYTES,
};
use super::CallContext;
use crate::config::{ControllerConfig, DriverConfig};
use crate::crd::{AccessType, BackendEndpoint, JivaVolume, JivaVolumeSpec, VolumePhase};
use crate::domain::ports::{BackendControlRef, ProvisionRequest, VolumeStoreRef};
use crate::error::{Code, Error, Result};
use crate::lock::VolumeLocks;
use crate::reconciler::{Outcome, QuorumReconciler, QuorumTarget};
use crate::store::{modify_status, wait_for_deletion};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Storage class parameter carrying the replica count
pub const REPLICA_COUNT_PARAM: &str = "replicaCount";

/// Prefix of the list tokens handed out by ListVolumes
const LIST_TOKEN_PREFIX: &str = "jv1.";

/// Controller service over a volume store and a backend
pub struct ControllerService {
    store: VolumeStoreRef,
    backend: BackendControlRef,
    reconciler: QuorumReconciler,
    locks: VolumeLocks,
    config: ControllerConfig,
    namespace: String,
    default_replica_count: u32,
}

impl ControllerService {
    pub fn new(
        store: VolumeStoreRef,
        backend: BackendControlRef,
        locks: VolumeLocks,
        config: &DriverConfig,
    ) -> Self {
        Self {
            reconciler: QuorumReconciler::new(backend.clone(), config.reconciler.clone()),
            store,
            backend,
            locks,
            config: config.controller.clone(),
            namespace: config.namespace.clone(),
            default_replica_count: config.default_replica_count,
        }
    }

    // =========================================================================
    // CreateVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume = %req.name))]
    pub async fn create_volume(
        &self,
        ctx: &CallContext,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse> {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidArgument("volume name missing".into()));
        }
        let capability = volume_capability(&req.volume_capabilities)?;
        let capacity_bytes = req
            .capacity_range
            .unwrap_or_default()
            .resolve(DEFAULT_CAPACITY_BYTES)?;
        let replica_count = self.replica_count(&req)?;
        let spec = JivaVolumeSpec {
            capacity_bytes,
            replica_count,
            access_mode: capability.access_mode,
            access_type: capability.access_type.clone(),
            parameters: req.parameters.clone(),
        };

        let _guard = self.locks.try_lock(req.name.as_str(), "CreateVolume")?;

        let volume = match self.store.get(&req.name).await? {
            Some(existing) => {
                if let Some(reason) = existing.mismatch(&spec) {
                    return Err(Error::AlreadyExists {
                        name: req.name,
                        reason,
                    });
                }
                match existing.phase() {
                    VolumePhase::Ready | VolumePhase::Published | VolumePhase::Resizing => {
                        debug!(phase = %existing.phase(), "volume already provisioned");
                        return Ok(CreateVolumeResponse {
                            volume: volume_info(&existing),
                        });
                    }
                    VolumePhase::Deleting => {
                        return Err(Error::Aborted(format!(
                            "volume {} is being deleted",
                            req.name
                        )));
                    }
                    VolumePhase::Creating | VolumePhase::Error => {
                        info!(phase = %existing.phase(), "resuming provisioning");
                        existing
                    }
                }
            }
            None => {
                let fresh = JivaVolume::creating(&req.name, &self.namespace, spec);
                match self.store.create(&fresh).await {
                    Ok(created) => created,
                    // Another controller instance won the race
                    Err(Error::AlreadyExists { name, .. }) => {
                        return Err(Error::Aborted(format!(
                            "volume {} was created concurrently",
                            name
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let ready = self.provision_and_wait(ctx, volume).await?;
        Ok(CreateVolumeResponse {
            volume: volume_info(&ready),
        })
    }

    fn replica_count(&self, req: &CreateVolumeRequest) -> Result<u32> {
        let count = match (req.replica_count, req.parameters.get(REPLICA_COUNT_PARAM)) {
            (Some(count), _) => count,
            (None, Some(raw)) => raw.trim().parse::<u32>().map_err(|_| {
                Error::InvalidArgument(format!("invalid {} parameter: {}", REPLICA_COUNT_PARAM, raw))
            })?,
            (None, None) => self.default_replica_count,
        };
        if count == 0 {
            return Err(Error::InvalidArgument(
                "replica count must be at least 1".into(),
            ));
        }
        Ok(count)
    }

    /// Provision the backend volume and wait for its replicas to form a
    /// quorum. A volume left in `Creating` or `Error` by an earlier attempt
    /// goes through the same path.
    async fn provision_and_wait(&self, ctx: &CallContext, volume: JivaVolume) -> Result<JivaVolume> {
        let name = volume.name().to_string();
        let store = self.store.as_ref();

        if volume.phase() == VolumePhase::Error {
            modify_status(store, &name, |v| v.transition(VolumePhase::Creating, None)).await?;
        }

        let request = ProvisionRequest {
            name: name.clone(),
            capacity_bytes: volume.spec.capacity_bytes,
            replica_count: volume.spec.replica_count,
            parameters: volume.spec.parameters.clone(),
        };
        let provisioned = ctx
            .run(&name, "provisioning", self.backend.provision(&request))
            .await;
        let endpoint = match provisioned {
            Ok(endpoint) => endpoint,
            // Left in Creating; the next CreateVolume resumes it
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => {
                self.mark_failed(&name, format!("provisioning failed: {}", e)).await;
                return Err(e);
            }
        };

        let recorded = endpoint.clone();
        modify_status(store, &name, move |v| {
            v.status_mut().endpoint = Some(recorded.clone());
            Ok(())
        })
        .await?;

        let started = Instant::now();
        let deadline = ctx.deadline_within(self.config.create_timeout());
        let outcome = match self
            .reconciler
            .wait_for_quorum(
                &name,
                &endpoint,
                QuorumTarget::replicas(request.replica_count),
                deadline,
                &ctx.cancel,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.mark_failed(&name, format!("replica status unavailable: {}", e)).await;
                return Err(e);
            }
        };

        match outcome {
            Outcome::Ready(snapshot) => {
                let capacity = request.capacity_bytes;
                let ready = modify_status(store, &name, |v| {
                    v.status_mut().capacity_bytes = capacity;
                    v.transition(VolumePhase::Ready, None)
                })
                .await?;
                info!(
                    healthy = snapshot.healthy_count(),
                    replicas = request.replica_count,
                    capacity_bytes = capacity,
                    "volume ready"
                );
                Ok(ready)
            }
            Outcome::TimedOut(last) => {
                let healthy = last.as_ref().map(|s| s.healthy_count()).unwrap_or(0);
                self.mark_failed(
                    &name,
                    format!(
                        "replica quorum not reached: {} of {} replicas healthy",
                        healthy, request.replica_count
                    ),
                )
                .await;
                Err(Error::DeadlineExceeded {
                    what: format!("replica quorum of volume {}", name),
                    elapsed: started.elapsed(),
                })
            }
            // Left in Creating; the next CreateVolume resumes it
            Outcome::Cancelled => Err(Error::Cancelled { volume_id: name }),
        }
    }

    /// Record a failed provisioning attempt without masking the cause
    async fn mark_failed(&self, name: &str, message: String) {
        let result = modify_status(self.store.as_ref(), name, |v| {
            v.transition(VolumePhase::Error, Some(message.clone()))
        })
        .await;
        if let Err(e) = result {
            warn!(volume = name, error = %e, "could not record provisioning failure");
        }
    }

    // =========================================================================
    // DeleteVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume = %req.volume_id))]
    pub async fn delete_volume(&self, ctx: &CallContext, req: DeleteVolumeRequest) -> Result<Empty> {
        let id = required_id(&req.volume_id)?;
        let _guard = self.locks.try_lock(id, "DeleteVolume")?;

        let volume = match self.store.get(id).await? {
            Some(volume) => volume,
            None => {
                debug!("volume already deleted");
                return Ok(Empty {});
            }
        };

        // Deleting is terminal, so it is only recorded once the backend
        // has agreed to let go of the volume
        if volume.phase() != VolumePhase::Deleting {
            ctx.run(id, "backend teardown", self.backend.teardown(id)).await?;
            match modify_status(self.store.as_ref(), id, |v| {
                v.transition(VolumePhase::Deleting, None)
            })
            .await
            {
                Ok(_) | Err(Error::VolumeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.store.delete(id).await?;
        let deadline = ctx.deadline_within(self.config.delete_timeout());
        ctx.run(
            id,
            "deletion",
            wait_for_deletion(
                self.store.as_ref(),
                id,
                deadline.saturating_duration_since(Instant::now()),
            ),
        )
        .await?;

        info!("volume deleted");
        Ok(Empty {})
    }

    // =========================================================================
    // ControllerExpandVolume
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(volume = %req.volume_id))]
    pub async fn controller_expand_volume(
        &self,
        ctx: &CallContext,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse> {
        let id = required_id(&req.volume_id)?;
        let requested = requested_size(req.capacity_range)?;
        let _guard = self.locks.try_lock(id, "ControllerExpandVolume")?;

        let volume = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))?;

        let current = volume.current_capacity();
        if requested < current {
            return Err(Error::ShrinkRejected {
                volume_id: id.to_string(),
                current_bytes: current,
                requested_bytes: requested,
            });
        }

        let phase = volume.phase();
        let resuming = phase == VolumePhase::Resizing;
        if !phase.is_usable() && !resuming {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is {} and cannot be expanded",
                id, phase
            )));
        }
        if requested == current && !resuming {
            debug!(capacity_bytes = current, "volume already at requested size");
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: current,
                node_expansion_required: node_expansion_required(&volume),
            });
        }

        // The backend may already hold the size of an interrupted resize.
        // Never ask it for less than that.
        let in_progress = volume
            .status
            .as_ref()
            .and_then(|s| s.resize_to)
            .filter(|_| resuming);
        let target_size = match in_progress {
            Some(pending) if pending > requested => {
                info!(
                    requested_bytes = requested,
                    pending_bytes = pending,
                    "resuming larger resize already in progress"
                );
                pending
            }
            _ => requested,
        };

        let endpoint = volume.endpoint().cloned().ok_or_else(|| {
            Error::FailedPrecondition(format!("volume {} has no backend endpoint", id))
        })?;

        modify_status(self.store.as_ref(), id, |v| {
            let prior = v.phase();
            v.transition(
                VolumePhase::Resizing,
                Some(format!("resizing to {} bytes", target_size)),
            )?;
            let status = v.status_mut();
            if prior != VolumePhase::Resizing {
                status.resize_from = Some(prior);
            }
            status.resize_to = Some(target_size);
            Ok(())
        })
        .await?;

        let resized = ctx
            .run(id, "resize", self.backend.resize(&endpoint, id, target_size))
            .await;
        if let Err(e) = resized {
            // An interrupted request may still have reached the backend
            if !resuming && !e.is_interrupted() {
                self.finish_resize(id, None).await?;
            }
            return Err(e);
        }

        let started = Instant::now();
        let deadline = ctx.deadline_within(self.config.expand_timeout());
        let outcome = self
            .reconciler
            .wait_for_quorum(
                id,
                &endpoint,
                QuorumTarget::at_size(volume.spec.replica_count, target_size),
                deadline,
                &ctx.cancel,
            )
            .await?;

        match outcome {
            Outcome::Ready(_) => {
                let updated = self.finish_resize(id, Some(target_size)).await?;
                info!(capacity_bytes = target_size, "volume expanded");
                Ok(ControllerExpandVolumeResponse {
                    capacity_bytes: target_size,
                    node_expansion_required: node_expansion_required(&updated),
                })
            }
            // Stays Resizing; a retry resumes the wait
            Outcome::TimedOut(_) => Err(Error::DeadlineExceeded {
                what: format!("resize of volume {} to {} bytes", id, target_size),
                elapsed: started.elapsed(),
            }),
            Outcome::Cancelled => Err(Error::Cancelled {
                volume_id: id.to_string(),
            }),
        }
    }

    /// Leave `Resizing` for the phase recorded when it was entered,
    /// recording the new capacity if the resize completed
    async fn finish_resize(&self, id: &str, capacity: Option<u64>) -> Result<JivaVolume> {
        modify_status(self.store.as_ref(), id, |v| {
            let status = v.status_mut();
            if let Some(capacity) = capacity {
                status.capacity_bytes = capacity;
            }
            status.resize_to = None;
            let back = status.resize_from.take().unwrap_or(VolumePhase::Ready);
            v.transition(back, None)
        })
        .await
    }

    // =========================================================================
    // ControllerPublishVolume / ControllerUnpublishVolume
    // =========================================================================

    #[instrument(skip(self, _ctx, req), fields(volume = %req.volume_id, node = %req.node_id))]
    pub async fn controller_publish_volume(
        &self,
        _ctx: &CallContext,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        let id = required_id(&req.volume_id)?;
        if req.node_id.trim().is_empty() {
            return Err(Error::InvalidArgument("node id missing".into()));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("volume capability missing".into()))?;

        let _guard = self.locks.try_lock(id, "ControllerPublishVolume")?;

        let volume = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))?;
        if !volume.phase().is_usable() {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is {} and cannot be published",
                id,
                volume.phase()
            )));
        }
        if capability.access_mode != volume.spec.access_mode {
            return Err(Error::InvalidArgument(format!(
                "access mode {} does not match the volume's {}",
                capability.access_mode, volume.spec.access_mode
            )));
        }
        if !capability.access_type.is_compatible(&volume.spec.access_type) {
            return Err(Error::InvalidArgument(
                "access type does not match the volume".into(),
            ));
        }
        let endpoint = volume.endpoint().cloned().ok_or_else(|| {
            Error::FailedPrecondition(format!("volume {} has no backend endpoint", id))
        })?;

        if volume.published_nodes().contains(&req.node_id) {
            debug!("already published to node");
            return Ok(ControllerPublishVolumeResponse {
                publish_context: publish_context(&endpoint),
            });
        }
        if volume.spec.access_mode.is_single_node() {
            if let Some(other) = volume.published_nodes().first() {
                return Err(Error::FailedPrecondition(format!(
                    "volume {} is already published to node {}",
                    id, other
                )));
            }
        }

        let node = req.node_id.clone();
        modify_status(self.store.as_ref(), id, |v| {
            if !v.published_nodes().contains(&node) {
                v.status_mut().published_nodes.push(node.clone());
            }
            v.transition(VolumePhase::Published, None)
        })
        .await?;

        info!("volume published");
        Ok(ControllerPublishVolumeResponse {
            publish_context: publish_context(&endpoint),
        })
    }

    /// An empty node id unpublishes the volume from every node
    #[instrument(skip(self, _ctx, req), fields(volume = %req.volume_id, node = %req.node_id))]
    pub async fn controller_unpublish_volume(
        &self,
        _ctx: &CallContext,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<Empty> {
        let id = required_id(&req.volume_id)?;
        let _guard = self.locks.try_lock(id, "ControllerUnpublishVolume")?;

        let volume = match self.store.get(id).await? {
            Some(volume) => volume,
            None => return Ok(Empty {}),
        };
        let node = req.node_id.trim().to_string();
        let present = if node.is_empty() {
            !volume.published_nodes().is_empty()
        } else {
            volume.published_nodes().contains(&node)
        };
        if !present {
            debug!("not published to node");
            return Ok(Empty {});
        }

        modify_status(self.store.as_ref(), id, |v| {
            let status = v.status_mut();
            status
                .published_nodes
                .retain(|n| !node.is_empty() && n != &node);
            if !status.published_nodes.is_empty() {
                return Ok(());
            }
            match v.phase() {
                VolumePhase::Published => v.transition(VolumePhase::Ready, None),
                VolumePhase::Resizing => {
                    v.status_mut().resize_from = Some(VolumePhase::Ready);
                    Ok(())
                }
                _ => Ok(()),
            }
        })
        .await?;

        info!("volume unpublished");
        Ok(Empty {})
    }

    // =========================================================================
    // ListVolumes
    // =========================================================================

    pub async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse> {
        let limit = match req.max_entries {
            0 => self.config.list_page_size,
            n => n,
        };
        let store_token = match req.starting_token.as_deref().filter(|t| !t.is_empty()) {
            None => None,
            Some(token) => Some(
                token
                    .strip_prefix(LIST_TOKEN_PREFIX)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| Error::Aborted(format!("invalid starting token {:?}", token)))?
                    .to_string(),
            ),
        };
        let had_token = store_token.is_some();

        let page = self.store.list(limit, store_token).await.map_err(|e| {
            if had_token && matches!(e.code(), Code::InvalidArgument | Code::Aborted) {
                Error::Aborted(format!("starting token rejected: {}", e))
            } else {
                e
            }
        })?;

        Ok(ListVolumesResponse {
            entries: page
                .volumes
                .iter()
                .map(|v| ListVolumesEntry {
                    volume: volume_info(v),
                    published_node_ids: v.published_nodes().to_vec(),
                })
                .collect(),
            next_token: page
                .continue_token
                .map(|t| format!("{}{}", LIST_TOKEN_PREFIX, t)),
        })
    }

    /// Every volume, fetched lazily one page at a time
    pub fn volume_stream(&self, page_size: u32) -> BoxStream<'_, Result<ListVolumesEntry>> {
        stream::try_unfold(Some(None::<String>), move |state| async move {
            let token = match state {
                Some(token) => token,
                None => return Ok::<_, Error>(None),
            };
            let page = self
                .list_volumes(ListVolumesRequest {
                    max_entries: page_size,
                    starting_token: token,
                })
                .await?;
            let next = page.next_token.map(Some);
            Ok(Some((
                stream::iter(page.entries.into_iter().map(Ok::<_, Error>)),
                next,
            )))
        })
        .try_flatten()
        .boxed()
    }

    // =========================================================================
    // ValidateVolumeCapabilities / ControllerGetCapabilities
    // =========================================================================

    pub async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        let id = required_id(&req.volume_id)?;
        if req.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument("volume capabilities missing".into()));
        }
        let volume = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))?;

        let unsupported = req.volume_capabilities.iter().find(|c| {
            c.access_mode != volume.spec.access_mode
                || !c.access_type.is_compatible(&volume.spec.access_type)
        });
        Ok(match unsupported {
            None => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(req.volume_capabilities),
                message: None,
            },
            Some(c) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: Some(format!(
                    "volume {} does not support access mode {} with {}",
                    id,
                    c.access_mode,
                    access_type_name(&c.access_type)
                )),
            },
        })
    }

    pub fn controller_get_capabilities(&self) -> ControllerGetCapabilitiesResponse {
        ControllerGetCapabilitiesResponse {
            capabilities: vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::PublishUnpublishVolume,
                ControllerCapability::ExpandVolume,
                ControllerCapability::ListVolumes,
            ],
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn required_id(id: &str) -> Result<&str> {
    if id.trim().is_empty() {
        return Err(Error::InvalidArgument("volume id missing".into()));
    }
    Ok(id)
}

fn requested_size(range: Option<CapacityRange>) -> Result<u64> {
    let range = range.ok_or_else(|| Error::InvalidArgument("capacity range missing".into()))?;
    match range.resolve(0)? {
        0 => Err(Error::InvalidArgument("required bytes missing".into())),
        size => Ok(size),
    }
}

/// The single capability a volume is created for
fn volume_capability(capabilities: &[VolumeCapability]) -> Result<&VolumeCapability> {
    let first = capabilities
        .first()
        .ok_or_else(|| Error::InvalidArgument("volume capabilities missing".into()))?;
    for capability in capabilities {
        if !capability.access_mode.is_supported() {
            return Err(Error::InvalidArgument(format!(
                "access mode {} is not supported",
                capability.access_mode
            )));
        }
        if capability.access_mode != first.access_mode
            || !capability.access_type.is_compatible(&first.access_type)
        {
            return Err(Error::InvalidArgument(
                "volume capabilities disagree on access mode or type".into(),
            ));
        }
    }
    Ok(first)
}

fn access_type_name(access_type: &AccessType) -> String {
    match access_type {
        AccessType::Block => "block".to_string(),
        AccessType::Mount { fs_type, .. } => format!("mount/{}", fs_type),
    }
}

fn volume_info(volume: &JivaVolume) -> VolumeInfo {
    let capacity_bytes = match volume.current_capacity() {
        0 => volume.spec.capacity_bytes,
        current => current,
    };
    let mut volume_context = BTreeMap::new();
    volume_context.insert(
        REPLICA_COUNT_PARAM.to_string(),
        volume.spec.replica_count.to_string(),
    );
    volume_context.insert(
        "accessType".to_string(),
        access_type_name(&volume.spec.access_type),
    );
    VolumeInfo {
        volume_id: volume.name().to_string(),
        capacity_bytes,
        volume_context,
    }
}

fn publish_context(endpoint: &BackendEndpoint) -> BTreeMap<String, String> {
    let mut context = BTreeMap::new();
    context.insert("targetPortal".to_string(), endpoint.target_portal.clone());
    context.insert("iqn".to_string(), endpoint.iqn.clone());
    context.insert("lun".to_string(), endpoint.lun.to_string());
    context
}

/// Block volumes never need the node to grow anything
fn node_expansion_required(volume: &JivaVolume) -> bool {
    !volume.spec.access_type.is_block() && !volume.published_nodes().is_empty()
}
