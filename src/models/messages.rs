use serde::{Deserialize, Serialize};

use crate::engine::{DiffOp, PatchBatch};

/// A batch of edits from a client, built against its last known revision.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EditMessage {
    pub patches: PatchBatch,
}

/// Full document state pushed once, right after a successful join.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InitMessage {
    pub text: String,
    pub version: u64,
}

/// Delta fanned out to the other members of a session after an accepted write.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiffMessage {
    pub diffs: Vec<DiffOp>,
}

/// Sent back to the originator of a patch batch that failed to apply.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RejectMessage {
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "edit")]
    Edit(EditMessage),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "init")]
    Init(InitMessage),
    #[serde(rename = "diff")]
    Diff(DiffMessage),
    #[serde(rename = "reject")]
    Reject(RejectMessage),
}
