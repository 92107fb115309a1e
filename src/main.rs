fn main() -> anyhow::Result<()> {
    gpspinger_lib::run()
}
