//! Fixed paths inside the sandbox

/// Home directory inside the sandbox
pub const HOME_PATH: &str = "/root";

/// Bind-mount target for the host build directory
pub const INSTALL_PATH: &str = "/root/dependencies";

/// Where python packages are installed (`<build>/python` on the host)
pub const PYTHON_INSTALL_PATH: &str = "/root/dependencies/python";

/// Where system package files are copied (`<build>/system` on the host)
pub const SYSTEM_INSTALL_PATH: &str = "/root/dependencies/system";

/// Where constraint files are staged (`<build>/constraints` on the host)
pub const CONSTRAINTS_PATH: &str = "/root/dependencies/constraints";

/// Identity marker written into every base image
pub const IMAGE_MARKER_PATH: &str = "/image-info.json";

/// Host-side directory names under the build directory
pub const HOST_PYTHON_DIR: &str = "python";
pub const HOST_SYSTEM_DIR: &str = "system";
pub const HOST_CONSTRAINTS_DIR: &str = "constraints";
