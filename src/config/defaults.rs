//! Default configuration values

/// Schema version of the persisted build state document
pub const STATE_SCHEMA_VERSION: &str = "0.3.0";

/// Version written into the identity marker of every base image
pub const IMAGE_MARKER_VERSION: &str = "0.2.0";

/// Schema tag accepted in system requirements documents
pub const SYSTEM_REQUIREMENTS_VERSION: i64 = 1;

/// Python version used when the caller does not pin one
pub const DEFAULT_PYTHON: &str = "3.9";

/// Oldest python we can build for
pub const MIN_PYTHON_VERSION: &str = "3.7";

/// Newest python known to work
pub const MAX_PYTHON_VERSION: &str = "3.9";

/// Name of the state document inside the build directory
pub const STATE_FILENAME: &str = "build-state.json";

/// Name of the artifact when no explicit path is given
pub const ARTIFACT_FILENAME: &str = "package.zip";

/// Name of the freeze file written next to the artifact
pub const FROZEN_FILENAME: &str = "frozen-requirements.txt";

/// Name of the project manifest read by the CLI
pub const MANIFEST_FILENAME: &str = "plz.toml";

/// Entries never copied into the archive (runtime already provides them)
pub const IGNORE: &[&str] = &["__pycache__", "awscli", "boto3", "botocore"];

/// Suffixes never copied into the archive
pub const IGNORE_FILETYPES: &[&str] = &[".dist-info", ".egg-info", ".pyc"];

/// Tooling installed into a fresh sandbox before its baseline is recorded
pub const BOOTSTRAP_PACKAGES: &[&str] = &["yum-utils"];

/// Base image every sandbox image derives from (`{version}` is the python version)
pub const BASE_IMAGE_TEMPLATE: &str = "lambci/lambda:build-python{version}";

/// Sandbox name used when neither the manifest nor the command line gives one
pub const DEFAULT_SANDBOX_NAME: &str = "plz";

/// Build directory used when neither the manifest nor the command line gives one
pub const DEFAULT_BUILD_DIR: &str = "build";
