fn main() -> anyhow::Result<()> {
    decisioning::run()?;
    Ok(())
}
