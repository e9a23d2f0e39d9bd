//! The replicated register, the state machine this server runs.
//!
//! A deliberately small machine: one `u64` register with read, write, and
//! add commands. It exists to exercise the consensus stack end to end;
//! swapping in a richer machine only means implementing
//! [`StateMachine`] for it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use keel_raft::{Result, StateMachine};

/// Commands accepted by the register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterCommand {
    /// Read the current value.
    Get,
    /// Overwrite the value.
    Set { value: u64 },
    /// Add to the value, wrapping on overflow.
    Add { delta: u64 },
}

/// Every command answers with the register value after the command ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub value: u64,
}

/// Serializes a command for [`keel_client::Client::submit`].
pub fn encode_command(command: &RegisterCommand) -> Bytes {
    // An enum of unit and integer variants cannot fail to serialize.
    Bytes::from(bincode::serialize(command).unwrap_or_default())
}

/// Deserializes a machine response returned from a submit.
pub fn decode_response(data: &[u8]) -> Result<RegisterResponse> {
    Ok(bincode::deserialize(data)?)
}

/// The register itself.
#[derive(Debug, Default)]
pub struct RegisterMachine {
    value: u64,
}

impl StateMachine for RegisterMachine {
    fn apply(&mut self, command: &[u8]) -> Bytes {
        // Malformed commands must not panic and must leave every replica
        // in the same state, so they act as reads.
        match bincode::deserialize::<RegisterCommand>(command) {
            Ok(RegisterCommand::Get) | Err(_) => {}
            Ok(RegisterCommand::Set { value }) => self.value = value,
            Ok(RegisterCommand::Add { delta }) => self.value = self.value.wrapping_add(delta),
        }
        encode_response(self.value)
    }

    fn snapshot(&self) -> Bytes {
        encode_response(self.value)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        let state: RegisterResponse = bincode::deserialize(data)?;
        self.value = state.value;
        Ok(())
    }
}

fn encode_response(value: u64) -> Bytes {
    Bytes::from(bincode::serialize(&RegisterResponse { value }).unwrap_or_default())
}
