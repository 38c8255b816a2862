use super::{colorize_life, colorize_status, json_pretty, CliError, EXIT_SUCCESS};
use cairn_core::{Conn, Lifecycle};
use serde::Serialize;

#[derive(Serialize)]
struct MachineView {
    id: String,
    life: String,
    instance_id: String,
    principals: Vec<String>,
}

#[derive(Serialize)]
struct ServiceView {
    name: String,
    charm: String,
    life: String,
    subordinate: bool,
    leader: Option<String>,
    status: Option<String>,
}

#[derive(Serialize)]
struct UnitView {
    name: String,
    life: String,
    machine: Option<String>,
    principal: Option<String>,
    status: String,
    message: String,
    resolved: Option<String>,
}

#[derive(Serialize)]
struct RelationView {
    id: u64,
    key: String,
    life: String,
    units: u64,
}

#[derive(Serialize)]
struct StatusView {
    environment: String,
    machines: Vec<MachineView>,
    services: Vec<ServiceView>,
    units: Vec<UnitView>,
    relations: Vec<RelationView>,
}

pub fn run(conn: &Conn, json: bool) -> Result<u8, CliError> {
    let state = conn.state();
    let machines = state.all_machines()?;
    let services = state.all_services()?;
    let units = state.all_units()?;
    let relations = state.all_relations()?;

    if !json {
        println!("environment: {}", conn.environ().name());
        println!();
        println!("MACHINES");
        for m in &machines {
            let instance = if m.instance_id().is_empty() {
                "pending"
            } else {
                m.instance_id()
            };
            println!(
                "  {:<6} {:<8} {:<12} {}",
                m.id().to_string(),
                colorize_life(m.life()),
                instance,
                m.principals().join(", ")
            );
        }
        println!();
        println!("SERVICES");
        for s in &services {
            let status = s
                .status()
                .map_or_else(|| "-".to_owned(), |st| colorize_status(st.status));
            println!(
                "  {:<16} {:<8} {:<28} {}",
                s.name(),
                colorize_life(s.life()),
                s.charm_url().to_string(),
                status
            );
        }
        println!();
        println!("UNITS");
        for u in &units {
            let status = u.status();
            let mut line = format!(
                "  {:<20} {:<8} machine {:<4} {}",
                u.name(),
                colorize_life(u.life()),
                u.machine_id().unwrap_or("-"),
                colorize_status(status.status)
            );
            if !status.message.is_empty() {
                line.push_str(&format!(" ({})", status.message));
            }
            if !u.resolved().as_str().is_empty() {
                line.push_str(&format!(" resolved: {}", u.resolved()));
            }
            println!("{line}");
        }
        println!();
        println!("RELATIONS");
        for r in &relations {
            println!(
                "  {:<4} {:<8} {} ({} in scope)",
                r.id(),
                colorize_life(r.life()),
                r.key(),
                r.unit_count()
            );
        }
        return Ok(EXIT_SUCCESS);
    }

    let view = StatusView {
        environment: conn.environ().name().to_owned(),
        machines: machines
            .iter()
            .map(|m| MachineView {
                id: m.id().to_string(),
                life: m.life().as_str().to_owned(),
                instance_id: m.instance_id().to_owned(),
                principals: m.principals().to_vec(),
            })
            .collect(),
        services: services
            .iter()
            .map(|s| ServiceView {
                name: s.name().to_owned(),
                charm: s.charm_url().to_string(),
                life: s.life().as_str().to_owned(),
                subordinate: s.is_subordinate(),
                leader: s.leader().map(str::to_owned),
                status: s.status().map(|st| st.status.as_str().to_owned()),
            })
            .collect(),
        units: units
            .iter()
            .map(|u| UnitView {
                name: u.name().to_string(),
                life: u.life().as_str().to_owned(),
                machine: u.machine_id().map(str::to_owned),
                principal: u.principal_name().map(str::to_owned),
                status: u.status().status.as_str().to_owned(),
                message: u.status().message.clone(),
                resolved: Some(u.resolved().as_str())
                    .filter(|m| !m.is_empty())
                    .map(str::to_owned),
            })
            .collect(),
        relations: relations
            .iter()
            .map(|r| RelationView {
                id: r.id(),
                key: r.key().to_owned(),
                life: r.life().as_str().to_owned(),
                units: r.unit_count(),
            })
            .collect(),
    };
    println!("{}", json_pretty(&view)?);
    Ok(EXIT_SUCCESS)
}
