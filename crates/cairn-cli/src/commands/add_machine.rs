use super::{json_pretty, CliError, EXIT_SUCCESS};
use cairn_core::Conn;

pub fn run(conn: &Conn, json: bool) -> Result<u8, CliError> {
    let machine = conn.state().add_machine()?;
    if json {
        let payload = serde_json::json!({ "machine": machine.id().as_str() });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("created machine {}", machine.id());
    }
    Ok(EXIT_SUCCESS)
}
