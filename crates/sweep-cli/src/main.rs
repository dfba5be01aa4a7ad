use sweep_runner::ExperimentRegistry;

fn main() -> anyhow::Result<()> {
    let mut registry = ExperimentRegistry::new();
    sweep_cli::register_builtins(&mut registry);
    sweep_cli::run(registry)
}
