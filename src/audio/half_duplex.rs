//! Half-duplex arbitration.
//!
//! While the agent is speaking, microphone frames are dropped entirely
//! rather than replaced with silence. Sending gated silence would still feed
//! the remote turn-detector a steady stream of frames; dropping keeps the
//! channel quiet and eliminates echo-driven self-interruption.

/// Decide whether a capture frame may be forwarded to the transport.
pub fn should_forward(agent_speaking: bool) -> bool {
    !agent_speaking
}
