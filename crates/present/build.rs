use anyhow::Context;
use gl_generator::{Api, Fallbacks, Profile, Registry, StructGenerator};
use std::env;
use std::fs::File;
use std::path::Path;

/// Create struct style gl bindings loaded per context.
fn create_gl_bindings(out_dir: &str) -> anyhow::Result<()> {
    let mut gl = File::create(Path::new(&out_dir).join("gl_bindings.rs"))
        .context("Unable to generate gl bindings")?;

    Registry::new(Api::Gl, (3, 1), Profile::Core, Fallbacks::All, [])
        .write_bindings(StructGenerator, &mut gl)
        .context("Couldn't write gl bindings")?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let dest = env::var("OUT_DIR")?;
    create_gl_bindings(&dest)?;

    Ok(())
}
