use super::{json_pretty, CliError, EXIT_SUCCESS};
use cairn_core::Conn;

pub fn run(conn: &Conn, service: &str, n: usize, json: bool) -> Result<u8, CliError> {
    let mut service = conn.state().service(service)?;
    let units = conn.add_units(&mut service, n)?;
    if json {
        let added: Vec<_> = units
            .iter()
            .map(|u| {
                serde_json::json!({
                    "unit": u.name().as_str(),
                    "machine": u.machine_id(),
                })
            })
            .collect();
        println!("{}", json_pretty(&added)?);
    } else {
        for unit in &units {
            println!(
                "added unit {} to machine {}",
                unit.name(),
                unit.machine_id().unwrap_or("-")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
