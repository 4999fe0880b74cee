//! Polling collector — fixed-interval reads of a binary register block
//!
//! Each tick reads the whole configured block, decodes every tag per its
//! declared register type, and stamps the poll timestamp on all samples
//! from that block. A failed read backs off and reconnects; a tag that
//! fails to decode is accounted as Missing but never enqueued.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{RegisterSpec, RegisterType, SourceKind, SourceSpec};
use crate::types::Sample;

use super::{Backoff, CollectorContext, RegisterClient, SourceHealthState};

/// Decode one tag's value out of a register block.
///
/// Returns None when the registers fall outside the block — the read
/// succeeded but this tag's slice is unusable.
pub fn decode_register(block: &[u16], spec: RegisterSpec) -> Option<f64> {
    let base = spec.address as usize;
    match spec.kind {
        RegisterType::Uint16 => block.get(base).map(|&w| f64::from(w)),
        RegisterType::Int16 => block.get(base).map(|&w| f64::from(w as i16)),
        RegisterType::Float32Be => {
            let hi = *block.get(base)?;
            let lo = *block.get(base + 1)?;
            let bits = (u32::from(hi) << 16) | u32::from(lo);
            Some(f64::from(f32::from_bits(bits)))
        }
        RegisterType::Float32Le => {
            let lo = *block.get(base)?;
            let hi = *block.get(base + 1)?;
            let bits = (u32::from(hi) << 16) | u32::from(lo);
            Some(f64::from(f32::from_bits(bits)))
        }
        RegisterType::Int32Be => {
            let hi = *block.get(base)?;
            let lo = *block.get(base + 1)?;
            let bits = (u32::from(hi) << 16) | u32::from(lo);
            Some(f64::from(bits as i32))
        }
    }
}

/// Run loop: connect, poll at the fixed interval, decode the block; on
/// read failure back off, reconnect and resume.
pub(super) async fn run(
    spec: SourceSpec,
    mut client: Box<dyn RegisterClient>,
    mut ctx: CollectorContext,
    health: Arc<SourceHealthState>,
    cancel: CancellationToken,
) {
    let SourceKind::Polling {
        poll_interval_ms,
        block_size,
    } = spec.kind
    else {
        tracing::error!(source = %spec.source_id, "Polling run loop on non-polling source");
        return;
    };
    let mut backoff = Backoff::new(spec.backoff);

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = client.connect().await {
            health.mark_error(crate::types::now_ms());
            let delay = backoff.next_delay();
            tracing::warn!(
                source = %spec.source_id,
                error = %e,
                retry_ms = delay.as_millis() as u64,
                "Polling connect failed"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => continue,
            }
        }
        health.mark_connected(true);
        backoff.reset();

        let mut tick = tokio::time::interval(Duration::from_millis(poll_interval_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    client.close().await;
                    break 'reconnect;
                }
                _ = tick.tick() => {
                    match client.read_block(block_size).await {
                        Ok(block) => {
                            let poll_ts = crate::types::now_ms();
                            for tag in &spec.tags {
                                let Some(register) = tag.register else { continue };
                                match decode_register(&block, register) {
                                    Some(value) => {
                                        let mut sample = Sample::raw(
                                            &spec.source_id,
                                            &tag.name,
                                            poll_ts,
                                            value,
                                        )
                                        .with_register(register.address);
                                        if let Some(unit) = &tag.unit {
                                            sample.meta.unit = Some(unit.clone());
                                        }
                                        ctx.ingest(sample).await;
                                    }
                                    None => {
                                        // Accounting only; nothing reaches
                                        // the store for this tag.
                                        ctx.note_missing(&tag.name);
                                    }
                                }
                            }
                            ctx.housekeeping(poll_ts).await;
                        }
                        Err(e) => {
                            health.mark_connected(false);
                            health.mark_error(crate::types::now_ms());
                            for tag in &spec.tags {
                                ctx.note_missing(&tag.name);
                            }
                            let delay = backoff.next_delay();
                            tracing::warn!(
                                source = %spec.source_id,
                                error = %e,
                                retry_ms = delay.as_millis() as u64,
                                "Register read failed, reconnecting"
                            );
                            client.close().await;
                            tokio::select! {
                                _ = cancel.cancelled() => break 'reconnect,
                                _ = tokio::time::sleep(delay) => continue 'reconnect,
                            }
                        }
                    }
                }
            }
        }
    }
    health.mark_connected(false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_float32_be() {
        let value = 123.456f32;
        let bits = value.to_bits();
        let block = vec![(bits >> 16) as u16, bits as u16];
        let spec = RegisterSpec {
            address: 0,
            kind: RegisterType::Float32Be,
        };
        assert!((decode_register(&block, spec).unwrap() - f64::from(value)).abs() < 1e-9);
    }

    #[test]
    fn test_decode_float32_le_word_swapped() {
        let value = -7.25f32;
        let bits = value.to_bits();
        // Low word first.
        let block = vec![bits as u16, (bits >> 16) as u16];
        let spec = RegisterSpec {
            address: 0,
            kind: RegisterType::Float32Le,
        };
        assert_eq!(decode_register(&block, spec).unwrap(), f64::from(value));
    }

    #[test]
    fn test_decode_integers() {
        let block = vec![0xFFFF, 42, 0x8000, 0x0001];
        assert_eq!(
            decode_register(&block, RegisterSpec { address: 0, kind: RegisterType::Int16 }),
            Some(-1.0)
        );
        assert_eq!(
            decode_register(&block, RegisterSpec { address: 0, kind: RegisterType::Uint16 }),
            Some(65_535.0)
        );
        assert_eq!(
            decode_register(&block, RegisterSpec { address: 1, kind: RegisterType::Uint16 }),
            Some(42.0)
        );
        // 0x8000_0001 as i32.
        assert_eq!(
            decode_register(&block, RegisterSpec { address: 2, kind: RegisterType::Int32Be }),
            Some(f64::from(i32::MIN + 1))
        );
    }

    #[test]
    fn test_decode_out_of_block() {
        let block = vec![1, 2];
        assert_eq!(
            decode_register(&block, RegisterSpec { address: 1, kind: RegisterType::Float32Be }),
            None
        );
        assert_eq!(
            decode_register(&block, RegisterSpec { address: 5, kind: RegisterType::Uint16 }),
            None
        );
    }
}
