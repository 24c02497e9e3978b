//! Conversions between balancer messages and their protobuf form.

use balancer::{
    BalancerMessage, ClusterLoadSnapshot, Heartbeat, IfBeat, LoadSample, MigrationDecision,
    load::OP_COUNT,
};
use dirtree::{FragTag, Rank};
use proto::generated::mds_balancer::{self as pb, envelope::Payload};
use utilities::result::Result;

use crate::executor::ExportNotice;

/// A decoded frame from a peer.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Balancer(BalancerMessage),
    Export(ExportNotice),
}

fn sample_to_pb(sample: &LoadSample) -> pb::LoadSample {
    pb::LoadSample {
        values: sample.values.to_vec(),
    }
}

fn sample_from_pb(sample: Option<pb::LoadSample>) -> Result<LoadSample> {
    let sample = sample.unwrap_or_default();
    let values: [f64; OP_COUNT] = sample.values.as_slice().try_into().map_err(|_| {
        format!(
            "load sample has {} counters, expected {OP_COUNT}",
            sample.values.len()
        )
    })?;
    Ok(LoadSample { values })
}

fn load_to_pb(load: &ClusterLoadSnapshot) -> pb::ClusterLoad {
    pb::ClusterLoad {
        auth: Some(sample_to_pb(&load.auth)),
        all: Some(sample_to_pb(&load.all)),
        req_rate: load.req_rate,
        request_count: load.request_count,
        queue_len: load.queue_len,
        cpu_load_avg: load.cpu_load_avg,
    }
}

fn load_from_pb(load: Option<pb::ClusterLoad>) -> Result<ClusterLoadSnapshot> {
    let load = load.ok_or("message carries no load")?;
    Ok(ClusterLoadSnapshot {
        auth: sample_from_pb(load.auth)?,
        all: sample_from_pb(load.all)?,
        req_rate: load.req_rate,
        request_count: load.request_count,
        queue_len: load.queue_len,
        cpu_load_avg: load.cpu_load_avg,
    })
}

pub fn encode(source: Rank, message: &BalancerMessage) -> pb::Envelope {
    let payload = match message {
        BalancerMessage::Heartbeat(beat) => Payload::Heartbeat(pb::Heartbeat {
            epoch: beat.epoch,
            load: Some(load_to_pb(&beat.load)),
            import_map: beat.import_map.iter().map(|(k, v)| (*k, *v)).collect(),
        }),
        BalancerMessage::IfBeat(beat) => Payload::IfBeat(pb::IfBeat {
            epoch: beat.epoch,
            load: Some(load_to_pb(&beat.load)),
            if_value: beat.if_value,
            decisions: beat
                .decisions
                .iter()
                .map(|d| pb::MigrationDecision {
                    target: d.target,
                    export_load: d.export_load,
                    export_percent: d.export_percent,
                })
                .collect(),
        }),
    };
    pb::Envelope {
        source,
        payload: Some(payload),
    }
}

pub fn encode_notice(source: Rank, notice: &ExportNotice) -> pb::Envelope {
    pb::Envelope {
        source,
        payload: Some(Payload::ExportNotice(pb::ExportNotice {
            path: notice.path.clone(),
            authority: notice.authority,
            load: Some(sample_to_pb(&notice.load)),
            frag_value: notice.frag.value(),
            frag_bits: u32::from(notice.frag.bits()),
        })),
    }
}

pub fn decode(envelope: pb::Envelope) -> Result<(Rank, Inbound)> {
    let source = envelope.source;
    let inbound = match envelope.payload {
        Some(Payload::Heartbeat(beat)) => Inbound::Balancer(BalancerMessage::Heartbeat(Heartbeat {
            epoch: beat.epoch,
            load: load_from_pb(beat.load)?,
            import_map: beat.import_map.into_iter().collect(),
        })),
        Some(Payload::IfBeat(beat)) => Inbound::Balancer(BalancerMessage::IfBeat(IfBeat {
            epoch: beat.epoch,
            load: load_from_pb(beat.load)?,
            if_value: beat.if_value,
            decisions: beat
                .decisions
                .into_iter()
                .map(|d| MigrationDecision {
                    target: d.target,
                    export_load: d.export_load,
                    export_percent: d.export_percent,
                })
                .collect(),
        })),
        Some(Payload::ExportNotice(notice)) => {
            let frag = u8::try_from(notice.frag_bits)
                .ok()
                .and_then(|bits| FragTag::new(notice.frag_value, bits))
                .ok_or_else(|| {
                    format!(
                        "invalid fragment {:#x}/{} for {}",
                        notice.frag_value, notice.frag_bits, notice.path
                    )
                })?;
            Inbound::Export(ExportNotice {
                path: notice.path,
                frag,
                authority: notice.authority,
                load: sample_from_pb(notice.load)?,
            })
        }
        None => return Err(format!("empty envelope from rank {source}").into()),
    };
    Ok((source, inbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancer::{ImportMap, OpType};

    fn snapshot() -> ClusterLoadSnapshot {
        let mut auth = LoadSample::default();
        auth.values[OpType::Read.index()] = 12.5;
        auth.values[OpType::Store.index()] = 1.0;
        ClusterLoadSnapshot {
            auth,
            all: auth,
            req_rate: 30.0,
            request_count: 900,
            queue_len: 2,
            cpu_load_avg: 0.25,
        }
    }

    #[test]
    fn heartbeat_survives_the_wire() {
        let message = BalancerMessage::Heartbeat(Heartbeat {
            epoch: 7,
            load: snapshot(),
            import_map: ImportMap::from([(0, 3.5), (2, 1.25)]),
        });
        let (source, inbound) = decode(encode(1, &message)).unwrap();
        assert_eq!(source, 1);
        assert_eq!(inbound, Inbound::Balancer(message));
    }

    #[test]
    fn decisions_keep_their_order() {
        let decisions = vec![
            MigrationDecision {
                target: 0,
                export_load: 15.0,
                export_percent: 0.1875,
            },
            MigrationDecision {
                target: 1,
                export_load: 7.5,
                export_percent: 0.09375,
            },
        ];
        let message = BalancerMessage::IfBeat(IfBeat {
            epoch: 3,
            load: snapshot(),
            if_value: 0.41,
            decisions: decisions.clone(),
        });
        match decode(encode(0, &message)).unwrap().1 {
            Inbound::Balancer(BalancerMessage::IfBeat(beat)) => {
                assert_eq!(beat.decisions, decisions);
                assert!(!beat.is_report());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_load_sample_is_rejected() {
        let mut envelope = encode(
            2,
            &BalancerMessage::Heartbeat(Heartbeat {
                epoch: 1,
                load: snapshot(),
                import_map: ImportMap::new(),
            }),
        );
        if let Some(Payload::Heartbeat(beat)) = envelope.payload.as_mut() {
            if let Some(load) = beat.load.as_mut() {
                load.auth = Some(pb::LoadSample { values: vec![1.0] });
            }
        }
        assert!(decode(envelope).is_err());
    }

    #[test]
    fn empty_envelope_is_rejected() {
        let envelope = pb::Envelope {
            source: 1,
            payload: None,
        };
        assert!(decode(envelope).is_err());
    }

    #[test]
    fn export_notice_keeps_fragment() {
        let notice = ExportNotice {
            path: "/home/alice".to_string(),
            frag: FragTag::new(0b01, 2).unwrap(),
            authority: 2,
            load: snapshot().auth,
        };
        let (_, inbound) = decode(encode_notice(0, &notice)).unwrap();
        assert_eq!(inbound, Inbound::Export(notice));
    }
}
