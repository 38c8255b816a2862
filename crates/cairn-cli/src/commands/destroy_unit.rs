use super::{CliError, EXIT_SUCCESS};
use cairn_core::Conn;

pub fn run(conn: &Conn, units: &[String]) -> Result<u8, CliError> {
    let names: Vec<&str> = units.iter().map(String::as_str).collect();
    conn.destroy_units(&names)?;
    Ok(EXIT_SUCCESS)
}
