//! Runners turn job request inputs into commands and hand them to a backend.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use tokio::fs;
use tracing::debug;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::Command;
use crate::backend::Job;
use crate::backend::create_backend;
use crate::config::CommandConfig;
use crate::config::LocalQueueConfig;
use crate::config::OutputConfig;
use crate::config::RunnerConfig;
use crate::config::ServiceConfig;
use crate::status::JobStatus;

pub mod args;
pub mod env;
pub mod value;

pub use args::Argument;
pub use value::InputValue;

/// The inputs of a job request, by argument identifier.
pub type Inputs = IndexMap<String, InputValue>;

/// A runner executes the jobs of one service on one backend.
#[derive(Debug, Clone)]
pub struct Runner {
    /// The name of the service.
    service: String,
    /// The name of the runner.
    name: String,
    /// The program and its fixed arguments.
    base_command: Vec<String>,
    /// The arguments built from the inputs.
    arguments: Vec<Argument>,
    /// The job environment.
    env: IndexMap<String, String>,
    /// The files produced by the service.
    outputs: Vec<OutputConfig>,
    /// Options handed to the service's selector.
    selector_options: IndexMap<String, serde_json::Value>,
    /// The backend executing the jobs.
    backend: Arc<dyn Backend>,
}

impl Runner {
    /// Constructs a runner with the given backend.
    ///
    /// `home` is the value of `SLIVKA_HOME` in the job environment.
    pub fn new(
        service: &str,
        name: &str,
        config: &ServiceConfig,
        backend: Arc<dyn Backend>,
        home: &Path,
    ) -> Result<Self> {
        let env = env::resolve(env::base_environment(home), &config.env);

        let base_command = match &config.command {
            CommandConfig::Line(line) => shlex::split(&env::expand(line, &env))
                .with_context(|| format!("failed to split command `{line}`"))?,
            CommandConfig::Args(args) => args
                .iter()
                .map(|a| env::expand(a, &env).into_owned())
                .collect(),
        };

        if base_command.is_empty() {
            bail!("the command of service `{service}` is empty");
        }

        let arguments = config
            .arguments
            .iter()
            .map(|a| Argument::new(a, &env))
            .collect::<Result<_>>()?;

        Ok(Self {
            service: service.to_string(),
            name: name.to_string(),
            base_command,
            arguments,
            env,
            outputs: config.outputs.clone(),
            selector_options: Default::default(),
            backend,
        })
    }

    /// Constructs a runner from its configuration, creating its backend.
    pub fn from_config(
        service: &str,
        name: &str,
        config: &ServiceConfig,
        runner: &RunnerConfig,
        local_queue: &LocalQueueConfig,
        home: &Path,
    ) -> Result<Self> {
        let backend = create_backend(&runner.backend, local_queue).with_context(|| {
            format!("failed to create the backend of runner `{name}` of service `{service}`")
        })?;
        Ok(Self {
            selector_options: runner.selector_options.clone(),
            ..Self::new(service, name, config, backend, home)?
        })
    }

    /// Gets the name of the service.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Gets the name of the runner.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the job environment.
    pub fn env(&self) -> &IndexMap<String, String> {
        &self.env
    }

    /// Gets the files produced by the service.
    pub fn outputs(&self) -> &[OutputConfig] {
        &self.outputs
    }

    /// Gets the options handed to the service's selector.
    pub fn selector_options(&self) -> &IndexMap<String, serde_json::Value> {
        &self.selector_options
    }

    /// Gets the backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Builds the full command line for the inputs.
    pub fn build_args(&self, inputs: &Inputs) -> Vec<String> {
        let mut args = self.base_command.clone();
        args.extend(args::interpolate_all(&self.arguments, inputs));
        args
    }

    /// Builds the command executed in `cwd` for the inputs.
    pub fn build_command(&self, inputs: &Inputs, cwd: &Path) -> Command {
        Command {
            args: self.build_args(inputs),
            cwd: cwd.to_path_buf(),
            env: self.env.clone(),
        }
    }

    /// Starts a single job.
    pub async fn start(&self, inputs: &Inputs, cwd: &Path) -> Result<Job> {
        let mut jobs = self.batch_start(&[(inputs, cwd)]).await?;
        jobs.pop()
            .context("the backend did not return a job for the submitted command")
    }

    /// Starts one job per request, in order.
    ///
    /// Working directories are created and input files are linked before
    /// anything is submitted.
    pub async fn batch_start(&self, requests: &[(&Inputs, &Path)]) -> Result<Vec<Job>> {
        let mut commands = Vec::with_capacity(requests.len());
        for (inputs, cwd) in requests {
            self.prepare_directory(inputs, cwd).await?;
            commands.push(self.build_command(inputs, cwd));
        }

        debug!(
            service = %self.service,
            runner = %self.name,
            count = commands.len(),
            "submitting jobs"
        );

        let jobs = self.backend.start(&commands).await?;
        if jobs.len() != commands.len() {
            bail!(
                "backend `{backend}` returned {jobs} jobs for {commands} commands",
                backend = self.backend.name(),
                jobs = jobs.len(),
                commands = commands.len()
            );
        }

        Ok(jobs)
    }

    /// Gets the status of the jobs, in order.
    pub async fn status(&self, jobs: &[Job]) -> Result<Vec<JobStatus>> {
        let statuses = self.backend.status(jobs).await?;
        if statuses.len() != jobs.len() {
            bail!(
                "backend `{backend}` returned {statuses} statuses for {jobs} jobs",
                backend = self.backend.name(),
                statuses = statuses.len(),
                jobs = jobs.len()
            );
        }

        Ok(statuses)
    }

    /// Requests cancellation of the jobs.
    pub async fn cancel(&self, jobs: &[Job]) -> Result<()> {
        self.backend.cancel(jobs).await
    }

    /// Creates the working directory and links the input files into it.
    async fn prepare_directory(&self, inputs: &Inputs, cwd: &Path) -> Result<()> {
        fs::create_dir_all(cwd).await.with_context(|| {
            format!(
                "failed to create working directory `{path}`",
                path = cwd.display()
            )
        })?;

        for argument in &self.arguments {
            let Some(name) = argument.symlink() else {
                continue;
            };

            let Some(value) = argument.effective_value(inputs.get(argument.id())) else {
                continue;
            };

            match value {
                InputValue::List(items) => {
                    for (i, item) in items.iter().enumerate() {
                        let target = cwd.join(format!("{name}.{i:04}"));
                        link_file(Path::new(&item.to_string()), &target).await?;
                    }
                }
                value => {
                    link_file(Path::new(&value.to_string()), &cwd.join(name)).await?;
                }
            }
        }

        Ok(())
    }
}

/// Links `source` to `target`.
///
/// A symbolic link is tried first, then a hard link and finally a copy. A
/// target already resolving to `source` is left alone; any other existing
/// target is replaced.
pub async fn link_file(source: &Path, target: &Path) -> Result<()> {
    let source: PathBuf = fs::canonicalize(source).await.with_context(|| {
        format!(
            "input file `{path}` does not exist",
            path = source.display()
        )
    })?;

    match fs::symlink_metadata(target).await {
        Ok(_) => {
            if resolves_to(target, &source).await {
                debug!(
                    "`{target}` already links to `{source}`",
                    target = target.display(),
                    source = source.display()
                );
                return Ok(());
            }

            fs::remove_file(target).await.with_context(|| {
                format!(
                    "failed to replace existing file `{target}`",
                    target = target.display()
                )
            })?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to inspect `{target}`", target = target.display())
            });
        }
    }

    match fs::symlink(&source, target).await {
        Ok(()) => return Ok(()),
        Err(e) => debug!(
            "failed to symlink `{source}`: {e}",
            source = source.display()
        ),
    }

    match fs::hard_link(&source, target).await {
        Ok(()) => return Ok(()),
        Err(e) => warn!(
            "failed to hard link `{source}`, copying instead: {e}",
            source = source.display()
        ),
    }

    // Copying a file onto itself truncates it.
    if resolves_to(target, &source).await {
        return Ok(());
    }

    fs::copy(&source, target).await.with_context(|| {
        format!(
            "failed to copy `{source}` to `{target}`",
            source = source.display(),
            target = target.display()
        )
    })?;

    Ok(())
}

/// Returns `true` if `path` is, or links to, the canonical path `canonical`.
async fn resolves_to(path: &Path, canonical: &Path) -> bool {
    fs::canonicalize(path)
        .await
        .is_ok_and(|resolved| resolved == canonical)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::ShellBackend;
    use crate::config::ArgumentConfig;
    use crate::config::SelectorConfig;

    fn service(command: CommandConfig, arguments: Vec<ArgumentConfig>) -> ServiceConfig {
        ServiceConfig {
            command,
            arguments,
            env: IndexMap::new(),
            outputs: Vec::new(),
            runners: IndexMap::new(),
            selector: SelectorConfig::Default,
            test: None,
        }
    }

    fn runner(config: &ServiceConfig) -> Runner {
        Runner::new(
            "example",
            "default",
            config,
            Arc::new(ShellBackend::new()),
            Path::new("/srv/slivka"),
        )
        .unwrap()
    }

    #[test]
    fn command_line_is_split() {
        let config = service(CommandConfig::Line(String::from("python 'my script.py'")), vec![]);
        assert_eq!(
            runner(&config).build_args(&Inputs::new()),
            ["python", "my script.py"]
        );
    }

    #[test]
    fn command_sees_environment() {
        let mut config = service(
            CommandConfig::Args(vec![String::from("$SLIVKA_HOME/bin/tool"), String::from("$$")]),
            vec![],
        );
        config
            .env
            .insert(String::from("UNUSED"), String::from("x"));
        assert_eq!(
            runner(&config).build_args(&Inputs::new()),
            ["/srv/slivka/bin/tool", "$"]
        );
    }

    #[test]
    fn environment_is_isolated() {
        // SAFETY: the variable is unique to this test.
        unsafe { std::env::set_var("SLIVKA_TEST_GLOBAL", "globalval") };

        let mut config = service(CommandConfig::Line(String::from("true")), vec![]);
        config
            .env
            .insert(String::from("DATA"), String::from("${SLIVKA_HOME}/data"));
        config
            .env
            .insert(String::from("LEAK"), String::from("$SLIVKA_TEST_GLOBAL"));
        let runner = runner(&config);

        assert!(!runner.env().contains_key("SLIVKA_TEST_GLOBAL"));
        assert_eq!(runner.env()["SLIVKA_HOME"], "/srv/slivka");
        assert_eq!(runner.env()["DATA"], "/srv/slivka/data");
        assert_eq!(runner.env()["LEAK"], "");
        assert_eq!(
            runner.env().get("PATH").cloned(),
            std::env::var("PATH").ok()
        );
    }

    #[test]
    fn arguments_follow_base_command() {
        let config = service(
            CommandConfig::Line(String::from("tool --quiet")),
            vec![ArgumentConfig {
                id: String::from("n"),
                arg: String::from("-n $(value)"),
                default: None,
                symlink: None,
                join: None,
            }],
        );
        let inputs: Inputs = [(String::from("n"), InputValue::Integer(3))].into_iter().collect();
        assert_eq!(runner(&config).build_args(&inputs), ["tool", "--quiet", "-n", "3"]);
    }

    #[tokio::test]
    async fn links_input_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        std::fs::write(&source, "data").unwrap();

        let config = service(
            CommandConfig::Line(String::from("cat")),
            vec![ArgumentConfig {
                id: String::from("input"),
                arg: String::from("$(value)"),
                default: None,
                symlink: Some(String::from("input.txt")),
                join: None,
            }],
        );
        let runner = runner(&config);
        let cwd = dir.path().join("job");
        let inputs: Inputs = [(
            String::from("input"),
            InputValue::from(source.to_string_lossy().into_owned()),
        )]
        .into_iter()
        .collect();

        runner.prepare_directory(&inputs, &cwd).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(cwd.join("input.txt")).unwrap(),
            "data"
        );
        assert_eq!(runner.build_args(&inputs), ["cat", "input.txt"]);
    }

    #[tokio::test]
    async fn missing_input_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = service(
            CommandConfig::Line(String::from("cat")),
            vec![ArgumentConfig {
                id: String::from("input"),
                arg: String::from("$(value)"),
                default: None,
                symlink: Some(String::from("input.txt")),
                join: None,
            }],
        );
        let inputs: Inputs = [(String::from("input"), InputValue::from("/no/such/file"))]
            .into_iter()
            .collect();

        let err = runner(&config)
            .prepare_directory(&inputs, dir.path())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("does not exist"));
    }

    #[tokio::test]
    async fn linking_again_keeps_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("input.fasta");
        let target = dir.path().join("input.txt");
        std::fs::write(&source, ">seq\nACGT\n").unwrap();

        link_file(&source, &target).await.unwrap();
        link_file(&source, &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(&source).unwrap(), ">seq\nACGT\n");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), ">seq\nACGT\n");
    }

    #[tokio::test]
    async fn stale_targets_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("new.txt");
        let target = dir.path().join("input.txt");
        std::fs::write(&source, "new").unwrap();
        std::fs::write(&target, "old").unwrap();

        link_file(&source, &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new");
    }
}
