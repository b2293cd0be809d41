//! Blocks and transactions, plus their protobuf wire form for the block log.
//!
//! Hand-written prost types, no prost-build. Field numbers are part of the
//! on-disk log format.

use prost::Message;

use upgrade_kernel::codec::{CodecError, ProtoPlan};
use upgrade_kernel::plan::Plan;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tx {
    /// Governance: schedule an upgrade plan.
    SchedulePlan(Plan),
    /// Governance: cancel the pending plan.
    CancelPlan,
    Write {
        partition: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        partition: String,
        key: Vec<u8>,
    },
}

impl Tx {
    pub fn write(partition: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Tx::Write {
            partition: partition.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Tx::SchedulePlan(_) => "schedule_plan",
            Tx::CancelPlan => "cancel_plan",
            Tx::Write { .. } => "write",
            Tx::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub txs: Vec<Tx>,
}

impl Block {
    pub fn new(height: u64, txs: Vec<Tx>) -> Self {
        Self { height, txs }
    }

    pub fn empty(height: u64) -> Self {
        Self::new(height, Vec::new())
    }
}

// ── Wire types ─────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ProtoBlock {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(message, repeated, tag = "2")]
    pub txs: Vec<ProtoTx>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoTx {
    #[prost(oneof = "TxKind", tags = "1, 2, 3, 4")]
    pub kind: Option<TxKind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum TxKind {
    #[prost(message, tag = "1")]
    SchedulePlan(ProtoPlan),
    #[prost(message, tag = "2")]
    CancelPlan(ProtoCancelPlan),
    #[prost(message, tag = "3")]
    Write(ProtoWrite),
    #[prost(message, tag = "4")]
    Delete(ProtoDelete),
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoCancelPlan {}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoWrite {
    #[prost(string, tag = "1")]
    pub partition: String,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoDelete {
    #[prost(string, tag = "1")]
    pub partition: String,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
}

// ── Bridge ─────────────────────────────────────────────────────

pub fn block_to_proto(block: &Block) -> ProtoBlock {
    ProtoBlock {
        height: block.height,
        txs: block.txs.iter().map(tx_to_proto).collect(),
    }
}

fn tx_to_proto(tx: &Tx) -> ProtoTx {
    let kind = match tx {
        Tx::SchedulePlan(plan) => TxKind::SchedulePlan(ProtoPlan::from(plan)),
        Tx::CancelPlan => TxKind::CancelPlan(ProtoCancelPlan {}),
        Tx::Write {
            partition,
            key,
            value,
        } => TxKind::Write(ProtoWrite {
            partition: partition.clone(),
            key: key.clone(),
            value: value.clone(),
        }),
        Tx::Delete { partition, key } => TxKind::Delete(ProtoDelete {
            partition: partition.clone(),
            key: key.clone(),
        }),
    };
    ProtoTx { kind: Some(kind) }
}

/// Convert a decoded wire block back into a `Block`. A transaction without a
/// kind is a corrupt record, not an empty transaction.
pub fn proto_to_block(proto: ProtoBlock) -> Result<Block, CodecError> {
    let height = proto.height;
    let txs = proto
        .txs
        .into_iter()
        .enumerate()
        .map(|(index, tx)| match tx.kind {
            Some(TxKind::SchedulePlan(plan)) => Ok(Tx::SchedulePlan(plan.into())),
            Some(TxKind::CancelPlan(_)) => Ok(Tx::CancelPlan),
            Some(TxKind::Write(w)) => Ok(Tx::Write {
                partition: w.partition,
                key: w.key,
                value: w.value,
            }),
            Some(TxKind::Delete(d)) => Ok(Tx::Delete {
                partition: d.partition,
                key: d.key,
            }),
            None => Err(CodecError::Decode {
                record: "block",
                reason: format!("tx {} at height {} has no kind", index, height),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Block { height, txs })
}

pub fn encode_block(block: &Block) -> Vec<u8> {
    block_to_proto(block).encode_to_vec()
}

pub fn decode_block(bytes: &[u8]) -> Result<Block, CodecError> {
    let proto = ProtoBlock::decode(bytes).map_err(|e| CodecError::Decode {
        record: "block",
        reason: e.to_string(),
    })?;
    proto_to_block(proto)
}
