use super::{json_pretty, CliError, EXIT_SUCCESS};
use cairn_core::Conn;

pub fn run(conn: &Conn, endpoints: &[String], json: bool) -> Result<u8, CliError> {
    let names: Vec<&str> = endpoints.iter().map(String::as_str).collect();
    let eps = conn.state().infer_endpoints(&names)?;
    let relation = conn.state().add_relation(&eps)?;
    if json {
        let payload = serde_json::json!({
            "id": relation.id(),
            "key": relation.key(),
            "endpoints": relation.endpoints(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("added relation {} ({})", relation.id(), relation.key());
    }
    Ok(EXIT_SUCCESS)
}
