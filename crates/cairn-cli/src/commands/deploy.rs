use super::{json_pretty, CliError, EXIT_SUCCESS};
use cairn_core::Conn;
use cairn_schema::{CharmArchive, CharmMeta, CharmUrl};
use serde_json::Value;
use std::fs;
use std::path::Path;

const DEFAULT_SERIES: &str = "precise";

pub fn run(
    conn: &Conn,
    metadata: &Path,
    bundle: &Path,
    name: Option<&str>,
    num_units: usize,
    json: bool,
) -> Result<u8, CliError> {
    let meta = CharmMeta::parse_file(metadata)
        .map_err(|e| CliError::User(format!("cannot read {}: {e}", metadata.display())))?;
    let bytes = fs::read(bundle)
        .map_err(|e| CliError::Failure(format!("cannot read {}: {e}", bundle.display())))?;
    let series = conn
        .environ()
        .all_attrs()
        .get("default-series")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SERIES);
    let url: CharmUrl = format!("local:{series}/{}", meta.name)
        .parse()
        .map_err(|e: cairn_schema::CharmError| CliError::User(e.to_string()))?;
    let archive = CharmArchive::new(meta, bytes);

    // Changed content for a stored charm becomes its next revision.
    let bump = conn
        .state()
        .latest_charm(&url)?
        .is_some_and(|latest| latest.bundle_sha256() != archive.sha256());
    let charm = conn.put_charm(&url, &archive, bump)?;
    let mut service = conn.add_service(name.unwrap_or(""), &charm)?;
    let units = if service.is_subordinate() || num_units == 0 {
        Vec::new()
    } else {
        conn.add_units(&mut service, num_units)?
    };

    if json {
        let payload = serde_json::json!({
            "service": service.name(),
            "charm": charm.url().to_string(),
            "units": units.iter().map(|u| u.name().as_str()).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("deployed {} as service {}", charm.url(), service.name());
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
