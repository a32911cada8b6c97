// related_world_server/server/src/network/hooks.rs
//! Coordinate correction in front of the native movement RPC handlers.

use crate::core::error::RelatedWorldResult;
use crate::entities::actor::Actor;
use crate::network::packed::{MoveResponseData, ServerMoveData};
use crate::network::rpc::{RpcCall, RpcDispatchTable, RpcEnv, RpcHandler, RpcInterceptor, RpcKind, RpcPayload};
use crate::world::transform::{convert, OriginFrame};
use std::sync::Arc;
use tracing::{info, trace};

/// RPCs whose coordinates are rewritten.
pub const HOOKED_RPCS: [RpcKind; 5] = RpcKind::ALL;

/// Rewrites positions at the boundary so the native handler only ever sees
/// coordinates in the frame it expects.
#[derive(Debug, Default)]
pub struct CorrectionInterceptor;

impl CorrectionInterceptor {
    /// Client: replicated movement arrives in the actor's related-world frame.
    fn client_replicated_movement(actor: &mut Actor, call: &mut RpcCall, env: &RpcEnv) -> bool {
        let Some(translation) = actor
            .correction
            .as_ref()
            .filter(|c| c.needs_correction())
            .map(|c| c.replicated_translation())
        else {
            return false;
        };
        if let RpcPayload::ReplicatedMovement(rep) = &mut call.payload {
            rep.location = convert(OriginFrame::related(translation), OriginFrame::persistent(env.local_origin), rep.location);
            trace!(actor = %actor.id, %translation, "Replicated movement rebased for client");
            return true;
        }
        false
    }

    /// Server: corrections leave in the persistent zero-origin frame.
    /// Returns true when the payload was rewritten into that frame.
    fn server_outbound(actor: &Actor, call: &mut RpcCall, env: &RpcEnv) -> RelatedWorldResult<bool> {
        let Some(translation) = actor.correction.as_ref().and_then(|c| c.live_translation()) else {
            return Ok(false);
        };
        let from = OriginFrame::new(translation, env.local_origin);
        match &mut call.payload {
            RpcPayload::AdjustPosition(adjustment) if !adjustment.base_relative => {
                adjustment.location = convert(from, OriginFrame::ABSOLUTE, adjustment.location);
                Ok(true)
            }
            RpcPayload::MoveResponse(bits) => {
                let mut data = MoveResponseData::decode(bits, env.max_packed_bits)?;
                if data.ack_only || data.base_relative {
                    return Ok(false);
                }
                data.location = convert(from, OriginFrame::ABSOLUTE, data.location);
                *bits = data.encode();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Server: client positions arrive in the persistent zero-origin frame.
    /// Returns true when the payload now sits in the actor's local frame.
    fn server_inbound(actor: &Actor, call: &mut RpcCall, env: &RpcEnv) -> RelatedWorldResult<bool> {
        let Some(translation) = actor.correction.as_ref().and_then(|c| c.live_translation()) else {
            return Ok(false);
        };
        let to = OriginFrame::new(translation, env.local_origin);
        match &mut call.payload {
            RpcPayload::ServerMove(bits) => {
                let mut data = ServerMoveData::decode(bits, env.max_packed_bits)?;
                if data.base_relative {
                    return Ok(false);
                }
                data.location = convert(OriginFrame::ABSOLUTE, to, data.location);
                *bits = data.encode();
                Ok(true)
            }
            RpcPayload::UpdateCamera(camera) => {
                camera.location = convert(OriginFrame::ABSOLUTE, to, camera.location);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl RpcInterceptor for CorrectionInterceptor {
    fn intercept(&self, actor: &mut Actor, call: &mut RpcCall, env: &RpcEnv, next: &dyn RpcHandler) -> RelatedWorldResult<()> {
        let is_server = env.net_mode.is_server();
        match call.kind {
            RpcKind::OnRepReplicatedMovement if !is_server => {
                if Self::client_replicated_movement(actor, call, env) {
                    return next.handle(actor, call, &env.with_zero_origin());
                }
            }
            RpcKind::ClientAdjustPosition | RpcKind::ClientMoveResponsePacked if is_server => {
                if Self::server_outbound(actor, call, env)? {
                    return next.handle(actor, call, &env.with_zero_origin());
                }
            }
            RpcKind::ServerMovePacked | RpcKind::ServerUpdateCamera if is_server => {
                if Self::server_inbound(actor, call, env)? {
                    return next.handle(actor, call, &env.with_zero_origin());
                }
            }
            _ => {}
        }
        next.handle(actor, call, env)
    }
}

pub fn install_correction_hooks(table: &RpcDispatchTable) -> Arc<CorrectionInterceptor> {
    let interceptor = Arc::new(CorrectionInterceptor);
    for kind in HOOKED_RPCS {
        table.install_hook(kind, interceptor.clone());
    }
    info!(count = HOOKED_RPCS.len(), "Movement correction hooks installed");
    interceptor
}

pub fn restore_correction_hooks(table: &RpcDispatchTable) -> usize {
    let mut restored = 0;
    for kind in HOOKED_RPCS {
        if table.restore(kind) {
            restored += 1;
        }
    }
    info!(restored, "Movement correction hooks restored");
    restored
}
