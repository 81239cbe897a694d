//! Ember Host
//!
//! Minimal binary that drives the embedding layer end to end against the
//! demo modules: start the interpreter, register search paths, load and
//! embed modules, publish a native buffer, call the scripted entry points,
//! tear down.

use anyhow::Result;
use ember_script::EmbeddedInterpreter;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    tracing::info!("Ember host v{}", ember_script::VERSION);

    let demos = std::env::var("EMBER_DEMOS").unwrap_or_else(|_| "demos".to_string());

    let interp = EmbeddedInterpreter::new();
    interp.initialize()?;
    interp.add_to_scope(demos.as_str())?;

    interp.embedded_module_load("static_data")?;

    let grid: Vec<f64> = (0..8).map(|i| f64::from(i) * 0.25).collect();
    let dims = [grid.len()];
    // grid outlives every accessor call below; it drops after finalize.
    unsafe {
        interp.embed_ptr("static_data", "attr", grid.as_ptr(), &dims)?;
    }
    interp.embed_value("static_data", "cellCount", grid.len() as i32)?;

    interp.module_load("interp.euler")?;
    for entry_point in ["initialize", "main", "finalize"] {
        interp.module_call("interp.euler", entry_point)?;
    }

    interp.finalize();
    tracing::info!("host run complete");

    Ok(())
}
