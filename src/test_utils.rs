//! Test utilities
//!
//! Proptest generators plus [`FakeSandbox`], an in-memory sandbox that speaks
//! the package manager commands the build issues and writes into the
//! bind-mounted host directory like a real container would.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::config::defaults::{DEFAULT_PYTHON, IMAGE_MARKER_VERSION};
use crate::config::paths::{IMAGE_MARKER_PATH, INSTALL_PATH, PYTHON_INSTALL_PATH};
use crate::core::inventory::PackageVersions;
use crate::core::requirements::{normalize_name, Requirement};
use crate::core::specifier::{lenient_version, satisfies};
use crate::error::ExecutorError;
use crate::infra::executor::{
    ExecOutput, ImageSpec, ListFilter, MountConfig, ResourceKind, SandboxExecutor, SandboxInfo,
};

pub mod generators {
    use proptest::prelude::*;

    /// Generate a valid package name (lowercase alphanumeric with hyphens)
    pub fn package_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,15}[a-z0-9]"
    }

    /// Generate a valid package version string
    pub fn package_version() -> impl Strategy<Value = String> {
        (1u32..20, 0u32..20, 0u32..20)
            .prop_map(|(major, minor, patch)| format!("{major}.{minor}.{patch}"))
    }
}

/// Image name `spawn_running` creates sandboxes from
pub const TEST_IMAGE: &str = "test-image";

/// Marker a compatible image carries
pub fn compatible_marker(python: &str) -> String {
    serde_json::json!({ "version": IMAGE_MARKER_VERSION, "python": python }).to_string()
}

/// A system package known to the fake package manager
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakePackage {
    pub version: String,
    /// Files present once installed
    pub files: Vec<String>,
    /// Files the owned-file query lists that never exist
    pub listed_only: Vec<String>,
}

impl FakePackage {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.files.push(path.to_string());
        self
    }

    pub fn with_listed_only(mut self, path: &str) -> Self {
        self.listed_only.push(path.to_string());
        self
    }
}

#[derive(Debug, Clone)]
struct FakeImage {
    id: String,
    marker: String,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    image: String,
    created_at: String,
    running: bool,
    host_dir: Option<PathBuf>,
    system: BTreeMap<String, FakePackage>,
    python: BTreeMap<String, String>,
}

/// In-memory sandbox engine
#[derive(Debug, Default)]
pub struct FakeSandbox {
    containers: Vec<FakeContainer>,
    images: BTreeMap<String, FakeImage>,
    preinstalled: BTreeMap<String, FakePackage>,
    repo: BTreeMap<String, FakePackage>,
    index: BTreeMap<String, Vec<String>>,
    without_version_attribute: BTreeSet<String>,
    vcs_projects: BTreeMap<String, String>,
    failing: Vec<String>,
    next_id: usize,
    mutations: Vec<String>,
}

fn output(stdout: impl Into<String>, exit_code: i32) -> ExecOutput {
    ExecOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code,
    }
}

fn failure(stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: 1,
    }
}

fn engine(operation: &str, message: impl Into<String>) -> ExecutorError {
    ExecutorError::Engine {
        operation: operation.to_string(),
        message: message.into(),
    }
}

impl FakeSandbox {
    /// A sandbox engine whose fresh containers come with `bash` preinstalled
    pub fn new() -> Self {
        let mut fake = Self::default();
        fake.add_preinstalled("bash", FakePackage::new("4.2.46-34.amzn2").with_file("/usr/bin/bash"));
        fake.add_preinstalled(
            "python3-libs",
            FakePackage::new("3.9.16-1.amzn2").with_file("/usr/lib64/libpython3.9.so.1.0"),
        );
        fake.add_repo_package("yum-utils", FakePackage::new("1.1.31-46.amzn2").with_file("/usr/bin/repoquery"));
        fake
    }

    /// Package present in every freshly created container
    pub fn add_preinstalled(&mut self, name: &str, package: FakePackage) {
        self.preinstalled.insert(name.to_string(), package);
    }

    /// Package `yum install` can install
    pub fn add_repo_package(&mut self, name: &str, package: FakePackage) {
        self.repo.insert(name.to_string(), package);
    }

    /// Python distribution `pip install` can install, in any version order
    pub fn add_python_package(&mut self, name: &str, versions: &[&str]) {
        let mut versions: Vec<String> = versions.iter().map(|v| (*v).to_string()).collect();
        versions.sort_by_key(|v| lenient_version(v));
        self.index.insert(normalize_name(name), versions);
    }

    /// Python module that does not expose `__version__`
    pub fn without_version_attribute(&mut self, name: &str) {
        self.without_version_attribute.insert(normalize_name(name));
    }

    /// VCS URLs containing `url` install `project`, whatever name the URL suggests
    pub fn add_vcs_project(&mut self, url: &str, project: &str) {
        self.vcs_projects.insert(url.to_string(), project.to_string());
    }

    /// Make every command containing `fragment` exit non-zero
    pub fn fail_command(&mut self, fragment: &str) {
        self.failing.push(fragment.to_string());
    }

    /// Stop failing scripted commands
    pub fn clear_failures(&mut self) {
        self.failing.clear();
    }

    /// Register an image with an arbitrary marker
    pub fn add_image(&mut self, name: &str, marker: &str) -> String {
        self.next_id += 1;
        let id = format!("sha256:{:064x}", self.next_id);
        self.images.insert(
            name.to_string(),
            FakeImage {
                id: id.clone(),
                marker: marker.to_string(),
            },
        );
        id
    }

    /// Overwrite the marker of an existing image
    pub fn set_image_marker(&mut self, name: &str, marker: &str) {
        if let Some(image) = self.images.get_mut(name) {
            image.marker = marker.to_string();
        }
    }

    /// Create and start a container on the test image without a bind mount
    pub fn spawn_running(&mut self, name: &str) -> String {
        self.spawn(name, None)
    }

    /// Create and start a container with `host` bound to the install path
    pub fn spawn_running_with_host(&mut self, name: &str, host: &Path) -> String {
        self.spawn(name, Some(host.to_path_buf()))
    }

    fn spawn(&mut self, name: &str, host_dir: Option<PathBuf>) -> String {
        if !self.images.contains_key(TEST_IMAGE) {
            self.add_image(TEST_IMAGE, &compatible_marker(DEFAULT_PYTHON));
        }
        let id = self.new_container(TEST_IMAGE, name, host_dir);
        if let Some(container) = self.container_mut(&id) {
            container.running = true;
        }
        id
    }

    fn new_container(&mut self, image: &str, name: &str, host_dir: Option<PathBuf>) -> String {
        self.next_id += 1;
        let id = format!("{:064x}", self.next_id);
        self.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            created_at: format!("2024-01-01T00:00:{:02}.000000000Z", self.next_id % 60),
            running: false,
            host_dir,
            system: self.preinstalled.clone(),
            python: BTreeMap::new(),
        });
        id
    }

    /// Install a repository package directly, as if done by hand
    pub fn install(&mut self, id: &str, name: &str) {
        if let Some(package) = self.repo.get(name).cloned() {
            if let Some(container) = self.container_mut(id) {
                container.system.insert(name.to_string(), package);
            }
        }
    }

    /// Bump an installed package to a new version
    pub fn upgrade(&mut self, id: &str, name: &str, version: &str) {
        if let Some(package) = self
            .container_mut(id)
            .and_then(|container| container.system.get_mut(name))
        {
            package.version = version.to_string();
        }
    }

    /// Versions of the system packages installed in a container
    pub fn installed_versions(&self, id: &str) -> PackageVersions {
        self.container(id)
            .map(|container| {
                container
                    .system
                    .iter()
                    .map(|(name, package)| (name.clone(), package.version.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Python packages installed in a container
    pub fn python_packages(&self, id: &str) -> BTreeMap<String, String> {
        self.container(id)
            .map(|container| container.python.clone())
            .unwrap_or_default()
    }

    /// Replace a container with a fresh one of the same name, as another tool would
    pub fn replace_container(&mut self, name: &str) -> Option<String> {
        let index = self.containers.iter().position(|c| c.name == name)?;
        let old = self.containers.remove(index);
        let id = self.new_container(&old.image, name, old.host_dir);
        Some(id)
    }

    /// Ids of every container
    pub fn container_ids(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.id.clone()).collect()
    }

    /// Whether a container is running
    pub fn is_running(&self, id: &str) -> bool {
        self.container(id).is_some_and(|c| c.running)
    }

    /// Names of every image
    pub fn image_names(&self) -> Vec<String> {
        self.images.keys().cloned().collect()
    }

    /// Every state-changing call made so far
    pub fn mutations(&self) -> &[String] {
        &self.mutations
    }

    /// Forget recorded mutations
    pub fn clear_mutations(&mut self) {
        self.mutations.clear();
    }

    fn container(&self, id: &str) -> Option<&FakeContainer> {
        self.containers.iter().find(|c| c.id == id)
    }

    fn container_mut(&mut self, id: &str) -> Option<&mut FakeContainer> {
        self.containers.iter_mut().find(|c| c.id == id)
    }

    fn mutate(&mut self, what: String) {
        self.mutations.push(what);
    }

    /// Host path of a sandbox path under the bind mount
    fn host_path(container: &FakeContainer, sandbox_path: &str) -> Option<PathBuf> {
        let rest = sandbox_path.strip_prefix(INSTALL_PATH)?;
        let host = container.host_dir.as_ref()?;
        Some(host.join(rest.trim_start_matches('/')))
    }

    fn listing(container: &FakeContainer) -> String {
        let mut out = String::from("Loaded plugins: ovl, priorities\nInstalled Packages\n");
        for (name, package) in &container.system {
            out.push_str(&format!(
                "{:<40}{:<30}@amzn2-core\n",
                format!("{name}.x86_64"),
                package.version
            ));
        }
        out
    }

    fn file_exists(container: &FakeContainer, path: &str) -> bool {
        container
            .system
            .values()
            .any(|package| package.files.iter().any(|f| f == path))
    }

    fn pick_version(&self, name: &str, specifier: &str) -> Option<String> {
        let versions = self.index.get(&normalize_name(name))?;
        versions
            .iter()
            .rev()
            .find(|version| satisfies(version, specifier))
            .cloned()
    }

    /// Pins for `name` found in constraint files
    fn constraints_for(container: &FakeContainer, files: &[String], name: &str) -> Vec<String> {
        let mut pins = Vec::new();
        for file in files {
            let Some(host) = Self::host_path(container, file) else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(host) else {
                continue;
            };
            for line in content.lines() {
                if let Some(Requirement::Plain {
                    name: pinned,
                    specifier,
                    ..
                }) = Requirement::parse(line)
                {
                    if normalize_name(&pinned) == normalize_name(name) && !specifier.is_empty() {
                        pins.push(specifier);
                    }
                }
            }
        }
        pins
    }

    fn pip_install(&mut self, index: usize, args: &[&str]) -> ExecOutput {
        let mut target = None;
        let mut constraints = Vec::new();
        let mut requirement = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "--target" => target = iter.next().map(|t| (*t).to_string()),
                "-c" | "--constraint" => {
                    if let Some(file) = iter.next() {
                        constraints.push((*file).to_string());
                    }
                }
                flag if flag.starts_with('-') => {}
                other => requirement = Some(other.to_string()),
            }
        }

        let Some(requirement) = requirement else {
            return failure("ERROR: You must give at least one requirement to install");
        };
        if target.as_deref() != Some(PYTHON_INSTALL_PATH) {
            return failure("unexpected install target");
        }

        let (name, specifier) = match Requirement::parse(&requirement) {
            Some(Requirement::Plain {
                name, specifier, ..
            }) => (name, specifier),
            Some(Requirement::Vcs { name_hint, line }) => {
                let project = self
                    .vcs_projects
                    .iter()
                    .find(|(url, _)| line.contains(url.as_str()))
                    .map_or(name_hint, |(_, project)| project.clone());
                (project, String::new())
            }
            _ => return output("Processing opaque requirement\n", 0),
        };

        let container = &self.containers[index];
        let mut combined = vec![specifier];
        combined.extend(Self::constraints_for(container, &constraints, &name));
        let combined = combined
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(",");

        let Some(version) = self.pick_version(&name, &combined) else {
            return failure(&format!(
                "ERROR: No matching distribution found for {requirement}"
            ));
        };

        let key = normalize_name(&name);
        let container = &mut self.containers[index];
        container.python.insert(key.clone(), version.clone());
        if let Some(host) = Self::host_path(container, PYTHON_INSTALL_PATH) {
            let module = host.join(key.replace('-', "_"));
            let written = std::fs::create_dir_all(&module)
                .and_then(|()| std::fs::write(module.join("__init__.py"), format!("__version__ = '{version}'\n")));
            if let Err(e) = written {
                return failure(&e.to_string());
            }
        }
        output(format!("Successfully installed {name}-{version}\n"), 0)
    }

    fn run(&mut self, index: usize, argv: &[&str]) -> ExecOutput {
        let joined = argv.join(" ");
        if self.failing.iter().any(|fragment| joined.contains(fragment.as_str())) {
            return failure("scripted failure");
        }

        match argv {
            ["true"] => output("", 0),
            ["false"] => output("", 1),
            ["cat", path] if *path == IMAGE_MARKER_PATH => {
                let image = &self.containers[index].image;
                match self.images.get(image) {
                    Some(image) => output(image.marker.clone(), 0),
                    None => failure("No such file or directory"),
                }
            }
            ["yum", "list", "installed"] => output(Self::listing(&self.containers[index]), 0),
            ["yum", "install", "-y", name] => {
                self.mutate(joined);
                let container = &self.containers[index];
                if container.system.contains_key(*name) {
                    return output("Nothing to do\n", 0);
                }
                match self.repo.get(*name).cloned() {
                    Some(package) => {
                        self.containers[index].system.insert((*name).to_string(), package);
                        output("Complete!\n", 0)
                    }
                    None => failure(&format!("No package {name} available.")),
                }
            }
            ["env", "PYTHON=python2", "amazon-linux-extras", "install", "epel"] => {
                self.mutate(joined);
                output("", 0)
            }
            ["repoquery", "--list", name] => {
                let container = &self.containers[index];
                let package = container.system.get(*name).or_else(|| self.repo.get(*name));
                let files = package
                    .map(|p| {
                        p.files
                            .iter()
                            .chain(p.listed_only.iter())
                            .map(|f| format!("{f}\n"))
                            .collect::<String>()
                    })
                    .unwrap_or_default();
                output(files, 0)
            }
            ["ls", "-L", path] => {
                let exists = Self::file_exists(&self.containers[index], path);
                output(if exists { format!("{path}\n") } else { String::new() }, i32::from(!exists) * 2)
            }
            ["cp", "-R", "-H", source, destination] => {
                self.mutate(joined);
                let container = &self.containers[index];
                if !Self::file_exists(container, source) {
                    return failure(&format!("cp: cannot stat '{source}'"));
                }
                let Some(dir) = Self::host_path(container, destination) else {
                    return output("", 0);
                };
                let file_name = source.rsplit('/').next().unwrap_or(source);
                let written = std::fs::create_dir_all(&dir)
                    .and_then(|()| std::fs::write(dir.join(file_name), source.as_bytes()));
                match written {
                    Ok(()) => output("", 0),
                    Err(e) => failure(&e.to_string()),
                }
            }
            ["rm", "-rf", path] => {
                self.mutate(joined);
                let container = &self.containers[index];
                if let Some(host) = Self::host_path(container, path) {
                    if host.is_dir() {
                        let _ = std::fs::remove_dir_all(&host);
                    } else {
                        let _ = std::fs::remove_file(&host);
                    }
                }
                output("", 0)
            }
            ["pip", "install", rest @ ..] => {
                self.mutate(joined);
                self.pip_install(index, rest)
            }
            ["python", "-c", code] => {
                let module = code
                    .strip_prefix("import ")
                    .and_then(|rest| rest.split(';').next())
                    .unwrap_or_default();
                let key = normalize_name(module);
                if self.without_version_attribute.contains(&key) {
                    return failure("AttributeError: module has no attribute '__version__'");
                }
                match self.containers[index].python.get(&key) {
                    Some(version) => output(format!("{version}\n"), 0),
                    None => failure(&format!("ModuleNotFoundError: No module named '{module}'")),
                }
            }
            ["pip", "show", name] => match self.containers[index].python.get(&normalize_name(name)) {
                Some(version) => output(format!("Name: {name}\nVersion: {version}\nSummary: fake\n"), 0),
                None => failure(&format!("WARNING: Package(s) not found: {name}")),
            },
            _ => ExecOutput {
                stdout: String::new(),
                stderr: format!("{}: command not found", argv.first().unwrap_or(&"")),
                exit_code: 127,
            },
        }
    }
}

impl SandboxExecutor for FakeSandbox {
    fn create(
        &mut self,
        image: &str,
        name: &str,
        binds: &[MountConfig],
    ) -> Result<String, ExecutorError> {
        self.mutate(format!("create {name}"));
        if !self.images.contains_key(image) {
            return Err(engine("create", format!("No such image: {image}")));
        }
        if self.containers.iter().any(|c| c.name == name) {
            return Err(engine(
                "create",
                format!("Conflict. The container name \"/{name}\" is already in use"),
            ));
        }
        let host_dir = binds
            .iter()
            .find(|bind| bind.container_path == Path::new(INSTALL_PATH))
            .map(|bind| bind.host_path.clone());
        Ok(self.new_container(image, name, host_dir))
    }

    fn start(&mut self, id: &str) -> Result<(), ExecutorError> {
        self.mutate(format!("start {id}"));
        let container = self
            .container_mut(id)
            .ok_or_else(|| engine("start", format!("No such container: {id}")))?;
        container.running = true;
        Ok(())
    }

    fn stop(&mut self, id: &str) -> Result<(), ExecutorError> {
        self.mutate(format!("stop {id}"));
        let container = self
            .container_mut(id)
            .ok_or_else(|| engine("stop", format!("No such container: {id}")))?;
        container.running = false;
        Ok(())
    }

    fn exec(
        &mut self,
        id: &str,
        argv: &[String],
        _env: &[(String, String)],
    ) -> Result<ExecOutput, ExecutorError> {
        let index = self
            .containers
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| engine("exec", format!("No such container: {id}")))?;
        if !self.containers[index].running {
            return Err(engine("exec", format!("Container {id} is not running")));
        }
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        Ok(self.run(index, &argv))
    }

    fn copy_out(
        &mut self,
        id: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), ExecutorError> {
        let container = self
            .container(id)
            .ok_or_else(|| engine("cp", format!("No such container: {id}")))?;
        if remote_path != IMAGE_MARKER_PATH {
            return Err(engine("cp", format!("Could not find the file {remote_path}")));
        }
        let marker = self
            .images
            .get(&container.image)
            .map(|image| image.marker.clone())
            .unwrap_or_default();
        std::fs::write(local_path, marker).map_err(|e| engine("cp", e.to_string()))
    }

    fn build_image(&mut self, name: &str, spec: &ImageSpec) -> Result<String, ExecutorError> {
        self.mutate(format!("build {name}"));
        let marker = spec
            .dockerfile
            .lines()
            .find(|line| line.contains(IMAGE_MARKER_PATH))
            .and_then(|line| Some(&line[line.find('{')?..=line.rfind('}')?]))
            .ok_or_else(|| engine("build", "Dockerfile writes no image marker"))?
            .to_string();
        Ok(self.add_image(name, &marker))
    }

    fn list(&mut self, filter: &ListFilter) -> Result<Vec<String>, ExecutorError> {
        Ok(match filter.kind {
            ResourceKind::Container => self
                .containers
                .iter()
                .filter(|c| c.name == filter.name)
                .map(|c| c.id.clone())
                .collect(),
            ResourceKind::Image => self
                .images
                .get(&filter.name)
                .map(|image| vec![image.id.clone()])
                .unwrap_or_default(),
        })
    }

    fn inspect(&mut self, id: &str) -> Result<SandboxInfo, ExecutorError> {
        let container = self
            .container(id)
            .ok_or_else(|| engine("inspect", format!("No such container: {id}")))?;
        Ok(SandboxInfo {
            id: container.id.clone(),
            created_at: container.created_at.clone(),
            running: container.running,
        })
    }

    fn remove(&mut self, kind: ResourceKind, id: &str) -> Result<(), ExecutorError> {
        self.mutate(format!("remove {kind} {id}"));
        match kind {
            ResourceKind::Container => {
                let index = self
                    .containers
                    .iter()
                    .position(|c| c.id == id)
                    .ok_or_else(|| engine("rm", format!("No such container: {id}")))?;
                if self.containers[index].running {
                    return Err(engine("rm", format!("container {id} is running")));
                }
                self.containers.remove(index);
            }
            ResourceKind::Image => {
                let before = self.images.len();
                self.images.retain(|_, image| image.id != id);
                if self.images.len() == before {
                    return Err(engine("rmi", format!("No such image: {id}")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fake_lists_and_inspects() {
        let mut fake = FakeSandbox::new();
        let id = fake.spawn_running("box");

        assert_eq!(fake.list(&ListFilter::container("box")).unwrap(), vec![id.clone()]);
        assert!(fake.list(&ListFilter::container("other")).unwrap().is_empty());
        assert_eq!(fake.list(&ListFilter::image(TEST_IMAGE)).unwrap().len(), 1);

        let info = fake.inspect(&id).unwrap();
        assert!(info.running);
    }

    #[test]
    fn test_fake_rejects_name_collision() {
        let mut fake = FakeSandbox::new();
        fake.spawn_running("box");

        let err = fake.create(TEST_IMAGE, "box", &[]).unwrap_err();
        assert!(matches!(err, ExecutorError::Engine { .. }));
    }

    #[test]
    fn test_fake_build_image_extracts_marker() {
        let mut fake = FakeSandbox::new();
        let spec = ImageSpec {
            dockerfile: format!("FROM scratch\nRUN echo '{{\"version\": \"9\"}}' > {IMAGE_MARKER_PATH}\n"),
        };
        fake.build_image("img", &spec).unwrap();
        let id = fake.create("img", "c", &[]).unwrap();
        fake.start(&id).unwrap();

        let out = fake
            .exec(&id, &["cat".to_string(), IMAGE_MARKER_PATH.to_string()], &[])
            .unwrap();
        assert_eq!(out.stdout, "{\"version\": \"9\"}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn test_pip_picks_highest_version(name in package_name(), versions in proptest::collection::vec(package_version(), 1..5)) {
            let mut fake = FakeSandbox::new();
            let refs: Vec<&str> = versions.iter().map(String::as_str).collect();
            fake.add_python_package(&name, &refs);
            let id = fake.spawn_running("box");

            let argv: Vec<String> = ["pip", "install", "--target", PYTHON_INSTALL_PATH, name.as_str()]
                .iter()
                .map(|s| (*s).to_string())
                .collect();
            let out = fake.exec(&id, &argv, &[]).unwrap();
            prop_assert!(out.success());

            let highest = versions.iter().max_by_key(|v| lenient_version(v)).cloned();
            prop_assert_eq!(fake.python_packages(&id).get(&normalize_name(&name)).cloned(), highest);
        }
    }
}
