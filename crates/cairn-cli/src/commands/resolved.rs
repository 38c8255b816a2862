use super::{CliError, EXIT_SUCCESS};
use cairn_core::Conn;

pub fn run(conn: &Conn, unit: &str, no_hooks: bool) -> Result<u8, CliError> {
    let mut unit = conn.state().unit(unit)?;
    conn.resolved(&mut unit, no_hooks)?;
    Ok(EXIT_SUCCESS)
}
