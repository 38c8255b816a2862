use super::{json_pretty, CliError, Context, EXIT_SUCCESS};
use cairn_core::{bootstrap, Conn};
use cairn_schema::EnvironConfig;
use std::fs;
use std::path::Path;

pub fn run(ctx: &Context, environ_path: &Path) -> Result<u8, CliError> {
    let environ = EnvironConfig::load(environ_path).map_err(|e| {
        CliError::User(format!("cannot read {}: {e}", environ_path.display()))
    })?;
    if ctx.environ_path().exists() {
        return Err(CliError::User(format!(
            "environment already initialised at {}",
            ctx.store.display()
        )));
    }
    fs::create_dir_all(&ctx.store).map_err(|e| {
        CliError::Failure(format!("cannot create {}: {e}", ctx.store.display()))
    })?;

    let state = bootstrap(&ctx.info(), ctx.config.clone(), &environ, None)?;
    state.close()?;
    fs::copy(environ_path, ctx.environ_path()).map_err(|e| {
        CliError::Failure(format!("cannot write {}: {e}", ctx.environ_path().display()))
    })?;
    // The first connection rotates the admin password and pushes secrets.
    let conn = Conn::new(environ, ctx.info(), ctx.config.clone(), None)?;
    let name = conn.environ().name().to_owned();
    conn.close()?;

    if ctx.json {
        let payload = serde_json::json!({
            "environment": name,
            "store": ctx.store.display().to_string(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "initialised environment {name} at {}",
            ctx.store.display()
        );
    }
    Ok(EXIT_SUCCESS)
}
