use super::{CliError, EXIT_SUCCESS};
use cairn_core::{set_unit_status, Conn, StatusSetArgs};

pub fn run(conn: &Conn, unit: &str, args: &[String]) -> Result<u8, CliError> {
    let args = StatusSetArgs::parse(args)?;
    let mut unit = conn.state().unit(unit)?;
    set_unit_status(&mut unit, &args)?;
    Ok(EXIT_SUCCESS)
}
