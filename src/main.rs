use anyhow::Context;

fn main() -> anyhow::Result<()> {
    keel::core::logging::init();
    keel::run().context("keel command failed")?;
    Ok(())
}
