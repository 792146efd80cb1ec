use crate::catalog::MinerDescriptor;
use crate::remote::RemoteCommand;

/// Decide whether a remote command asks for a switch.
///
/// Returns the miner to switch to when the command names one that differs
/// from the active miner; `None` means leave things as they are.
pub fn command_target<'a>(
    command: &'a RemoteCommand,
    active: Option<&MinerDescriptor>,
) -> Option<&'a MinerDescriptor> {
    let requested = command.coin.as_ref()?;
    match active {
        Some(current) if current == requested => None,
        _ => Some(requested),
    }
}
