//! Responses arriving on upstream links, routed back to the clients that asked.

use crate::connection::{ConnRole, ConnState, Connection, PinnedBind};
use crate::driver::{Next, PduHandler};
use crate::error::ProtocolError;
use crate::framing::MAX_UPSTREAM_PDU;
use crate::ldap_protocol::{is_final_response_tag, op_name, result_code, Pdu};
use crate::operation::{Operation, Side};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub struct UpstreamHandler;

impl PduHandler for UpstreamHandler {
    fn max_pdu_len(&self) -> usize {
        MAX_UPSTREAM_PDU
    }

    fn handle(&self, conn: &Arc<Connection>, pdu: Pdu) -> Result<Next, ProtocolError> {
        if pdu.msgid == 0 {
            // Unsolicited notification; the server is about to hang up
            warn!(
                "connid={} unsolicited notification from {} ({}): {}",
                conn.id(),
                conn.peer(),
                pdu.extended_oid().unwrap_or_default(),
                pdu.diagnostic_message().unwrap_or_default()
            );
            return Ok(Next::Close);
        }

        let is_final = is_final_response_tag(pdu.tag);
        let mut guard = conn.lock();
        let Some(op) = Operation::resolve(&guard, pdu.msgid) else {
            if guard.was_issued(pdu.msgid) {
                trace!(
                    "connid={} discarding {} for msgid={} no longer in flight",
                    conn.id(),
                    op_name(pdu.tag),
                    pdu.msgid
                );
                return Ok(Next::Continue);
            }
            return Err(ProtocolError::UnknownMessageId(pdu.msgid));
        };

        let bind_code = if is_final && op.is_bind() {
            Some(pdu.result_code().unwrap_or(result_code::OTHER))
        } else {
            None
        };
        let mut removed = false;
        if is_final {
            removed = op.detach_locked(Side::Upstream, &mut guard).removed;
            // An unfinished SASL exchange keeps the link reserved for its client
            if conn.role() == ConnRole::Bind && bind_code != Some(result_code::SASL_BIND_IN_PROGRESS) {
                guard.state = ConnState::Ready;
            }
        }
        drop(guard);

        let backend = op.backend();
        if removed {
            if let Some(backend) = &backend {
                backend.operation_finished();
            }
        }

        let Some(client) = op.client() else {
            abandon_sasl_link(conn, bind_code);
            return Ok(Next::Continue);
        };
        let mut cg = client.lock();
        if !cg.is_live() || !op.is_indexed(Side::Client, &cg) {
            drop(cg);
            trace!(
                "connid={} msgid={} client went away, dropping {}",
                op.client_connid(),
                op.client_msgid(),
                op_name(pdu.tag)
            );
            abandon_sasl_link(conn, bind_code);
            return Ok(Next::Continue);
        }
        client.send(&cg, pdu.encode(op.client_msgid()));
        if let Some(code) = bind_code {
            if code == result_code::SASL_BIND_IN_PROGRESS {
                cg.pinned_bind = Some(PinnedBind {
                    conn: Arc::downgrade(conn),
                    backend: backend.as_ref().map(Arc::downgrade).unwrap_or_default(),
                });
            } else {
                cg.state = ConnState::Ready;
                cg.pinned_bind = None;
                cg.auth_dn = if code == result_code::SUCCESS {
                    op.bind_dn().map(str::to_owned)
                } else {
                    None
                };
                debug!(
                    "connid={} bind as {:?} finished with result {}",
                    op.client_connid(),
                    op.bind_dn().unwrap_or_default(),
                    code
                );
            }
        }
        if is_final {
            op.detach_locked(Side::Client, &mut cg);
        }
        Ok(Next::Continue)
    }
}

/// A bind link left halfway through a SASL exchange nobody will finish
/// cannot be handed to another client.
fn abandon_sasl_link(conn: &Arc<Connection>, bind_code: Option<u32>) {
    if conn.role() != ConnRole::Bind || bind_code != Some(result_code::SASL_BIND_IN_PROGRESS) {
        return;
    }
    let mut guard = conn.lock();
    if guard.is_live() {
        Connection::retain(&mut guard);
        conn.mark_dead(guard);
    }
}
