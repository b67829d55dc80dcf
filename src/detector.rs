//! Auto-detects what a project is and how it should be deployed from the
//! marker files in its root, the way Render-style platforms do it. Detection
//! is read-only and depends only on file contents, so running it twice over
//! the same tree gives the same answer.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use strum::Display;
use tracing::debug;

use crate::persistence::{DeployConfig, DeploymentKind, Runtime};

const MARKER_FILES: &[&str] = &[
    "package.json",
    "requirements.txt",
    "Pipfile",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "Gemfile",
    "go.mod",
    "Cargo.toml",
    "composer.json",
    "index.html",
    "index.js",
    "app.py",
    "main.py",
    "server.js",
    "manage.py",
    "wsgi.py",
    "Procfile",
];

const PYTHON_WEB_FRAMEWORKS: &[&str] = &["django", "flask", "fastapi", "uvicorn", "starlette"];

const FRONTEND_DEPS: &[&str] = &["vite", "next", "gatsby", "vue", "react", "angular", "svelte"];
const SERVER_DEPS: &[&str] = &["express", "koa", "fastify", "hapi", "nestjs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Framework {
    Django,
    Flask,
    Fastapi,
    Python,
    Nextjs,
    ReactVite,
    Vue,
    Express,
    Nodejs,
    Maven,
    Gradle,
    Html,
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    #[serde(rename = "type")]
    pub kind: DeploymentKind,
    pub runtime: Runtime,
    pub framework: Framework,
    pub config: DeployConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestions {
    pub detected: String,
    pub deployment_type: &'static str,
    pub runtime: String,
    pub recommendations: Vec<String>,
}

pub struct ProjectDetector {
    files: HashMap<String, PathBuf>,
}

impl ProjectDetector {
    pub fn new(project_dir: &Path) -> Self {
        let mut files = HashMap::new();

        for name in MARKER_FILES {
            let path = project_dir.join(name);
            if path.exists() {
                files.insert((*name).to_string(), path);
            }
        }

        // Django keeps wsgi.py inside the project package, not at the root.
        if !files.contains_key("wsgi.py") {
            if let Some(path) = find_file(project_dir, "wsgi.py", 0) {
                files.insert("wsgi.py".to_string(), path);
            }
        }

        Self { files }
    }

    pub fn detect(&self) -> Detection {
        let (kind, runtime) = self.detect_project_type();
        let framework = self.detect_framework(runtime);
        let config = self.generate_config(kind, runtime, framework);

        debug!(%framework, %runtime, "project detection finished");

        Detection {
            kind,
            runtime,
            framework,
            config,
        }
    }

    pub fn suggestions(&self) -> Suggestions {
        let detection = self.detect();
        let mut recommendations = Vec::new();

        match detection.kind {
            DeploymentKind::Static => {
                if let Some(build) = &detection.config.build_command {
                    recommendations.push(format!("Build: {build}"));
                }
                if let Some(publish) = &detection.config.publish_dir {
                    recommendations.push(format!("Publish: {publish}"));
                }
            }
            DeploymentKind::Service => {
                if let Some(start) = &detection.config.start_command {
                    recommendations.push(format!("Start: {start}"));
                }
                if let Some(port) = detection.config.port {
                    recommendations.push(format!("Port: {port}"));
                }
            }
        }

        Suggestions {
            detected: format!("{} application", detection.framework),
            deployment_type: match detection.kind {
                DeploymentKind::Static => "Static Site",
                DeploymentKind::Service => "Web Service",
            },
            runtime: detection.runtime.to_string(),
            recommendations,
        }
    }

    fn detect_project_type(&self) -> (DeploymentKind, Runtime) {
        if let Some(requirements) = self.read_lower("requirements.txt") {
            if PYTHON_WEB_FRAMEWORKS.iter().any(|fw| requirements.contains(fw)) {
                return (DeploymentKind::Service, Runtime::Python);
            }
        }

        if self.has("app.py") || self.has("main.py") || self.has("manage.py") {
            return (DeploymentKind::Service, Runtime::Python);
        }

        if self.has("pom.xml") || self.has("build.gradle") || self.has("build.gradle.kts") {
            return (DeploymentKind::Service, Runtime::Java);
        }

        if let Some(package) = self.package_json() {
            let scripts = package
                .get("scripts")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let deps = dependency_names(&package);

            if FRONTEND_DEPS.iter().any(|dep| deps.contains(&dep.to_string()))
                && scripts.contains_key("build")
            {
                return (DeploymentKind::Static, Runtime::Nodejs);
            }

            if SERVER_DEPS.iter().any(|dep| deps.contains(&dep.to_string()))
                || self.has("server.js")
                || self.has("index.js")
            {
                return (DeploymentKind::Service, Runtime::Nodejs);
            }

            if scripts.contains_key("build") {
                return (DeploymentKind::Static, Runtime::Nodejs);
            }
        }

        (DeploymentKind::Static, Runtime::Static)
    }

    fn detect_framework(&self, runtime: Runtime) -> Framework {
        match runtime {
            Runtime::Python => self.detect_python_framework(),
            Runtime::Nodejs => self.detect_nodejs_framework(),
            Runtime::Java => {
                if self.has("pom.xml") {
                    Framework::Maven
                } else {
                    Framework::Gradle
                }
            }
            Runtime::Static => Framework::Html,
        }
    }

    fn detect_python_framework(&self) -> Framework {
        if self.has("manage.py") {
            return Framework::Django;
        }

        let Some(requirements) = self.read_lower("requirements.txt") else {
            return Framework::Python;
        };

        if requirements.contains("django") {
            Framework::Django
        } else if requirements.contains("fastapi") {
            Framework::Fastapi
        } else if requirements.contains("flask") {
            Framework::Flask
        } else {
            Framework::Python
        }
    }

    fn detect_nodejs_framework(&self) -> Framework {
        let Some(package) = self.package_json() else {
            return Framework::Nodejs;
        };
        let deps = dependency_names(&package);

        // Fixed priority; the first match names the framework.
        for (dep, framework) in [
            ("next", Framework::Nextjs),
            ("vite", Framework::ReactVite),
            ("vue", Framework::Vue),
            ("express", Framework::Express),
        ] {
            if deps.contains(&dep.to_string()) {
                return framework;
            }
        }

        Framework::Nodejs
    }

    fn generate_config(
        &self,
        kind: DeploymentKind,
        runtime: Runtime,
        framework: Framework,
    ) -> DeployConfig {
        match kind {
            DeploymentKind::Static => static_config(framework),
            DeploymentKind::Service => match runtime {
                Runtime::Python => self.python_config(framework),
                Runtime::Nodejs => self.nodejs_config(),
                Runtime::Java => DeployConfig {
                    runtime: Some(Runtime::Java),
                    port: Some(8080),
                    ..Default::default()
                },
                Runtime::Static => DeployConfig::default(),
            },
        }
    }

    fn python_config(&self, framework: Framework) -> DeployConfig {
        let mut config = DeployConfig {
            runtime: Some(Runtime::Python),
            entry_file: Some("app.py".to_string()),
            port: Some(5000),
            ..Default::default()
        };

        let has_gunicorn = self
            .read_lower("requirements.txt")
            .map(|reqs| reqs.contains("gunicorn"))
            .unwrap_or(false);

        match framework {
            Framework::Django => {
                config.port = Some(8000);
                config.entry_file = Some("manage.py".to_string());

                if has_gunicorn {
                    let project = self.django_project_name();
                    config.start_command = Some(match project {
                        Some(name) => {
                            format!("gunicorn {name}.wsgi:application --bind 0.0.0.0:8000")
                        }
                        None => {
                            "gunicorn <project_name>.wsgi:application --bind 0.0.0.0:8000"
                                .to_string()
                        }
                    });
                } else {
                    config.start_command =
                        Some("python manage.py runserver 0.0.0.0:8000".to_string());
                }
            }
            Framework::Flask => {
                config.start_command = Some(if has_gunicorn {
                    "gunicorn app:app --bind 0.0.0.0:5000".to_string()
                } else {
                    "python app.py".to_string()
                });
            }
            _ => {}
        }

        config
    }

    fn nodejs_config(&self) -> DeployConfig {
        let mut config = DeployConfig {
            runtime: Some(Runtime::Nodejs),
            entry_file: Some("index.js".to_string()),
            port: Some(3000),
            start_command: Some("node index.js".to_string()),
            ..Default::default()
        };

        if let Some(package) = self.package_json() {
            let has_start = package
                .get("scripts")
                .and_then(|scripts| scripts.get("start"))
                .is_some();
            if has_start {
                config.start_command = Some("npm start".to_string());
            }
        }

        config
    }

    /// Resolves the Django project package name, first from the parent
    /// directory of wsgi.py, then from DJANGO_SETTINGS_MODULE in manage.py.
    pub fn django_project_name(&self) -> Option<String> {
        if let Some(wsgi) = self.files.get("wsgi.py") {
            if let Some(parent) = wsgi.parent().and_then(Path::file_name) {
                return Some(parent.to_string_lossy().into_owned());
            }
        }

        let manage = fs::read_to_string(self.files.get("manage.py")?).ok()?;
        settings_module_from_manage_py(&manage)
            .map(|module| module.split('.').next().unwrap_or(&module).to_string())
    }

    fn has(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn read_lower(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.files.get(name)?)
            .ok()
            .map(|text| text.to_lowercase())
    }

    fn package_json(&self) -> Option<Value> {
        let text = fs::read_to_string(self.files.get("package.json")?).ok()?;
        serde_json::from_str(&text).ok()
    }
}

fn static_config(framework: Framework) -> DeployConfig {
    let (build_command, publish_dir) = match framework {
        Framework::ReactVite => ("npm install && npm run build", "dist"),
        Framework::Nextjs => ("npm install && npm run build && npm run export", "out"),
        Framework::Html => ("echo \"No build needed\"", "."),
        _ => ("npm install && npm run build", "dist"),
    };

    DeployConfig {
        build_command: Some(build_command.to_string()),
        publish_dir: Some(publish_dir.to_string()),
        ..Default::default()
    }
}

fn dependency_names(package: &Value) -> Vec<String> {
    let mut names = Vec::new();
    for table in ["dependencies", "devDependencies"] {
        if let Some(deps) = package.get(table).and_then(Value::as_object) {
            names.extend(deps.keys().cloned());
        }
    }
    names
}

/// Depth-first search for a file by name, skipping vendored trees.
pub fn find_file(dir: &Path, name: &str, depth: usize) -> Option<PathBuf> {
    if depth > 6 {
        return None;
    }

    let entries = fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();

    for entry in entries.flatten() {
        let path = entry.path();
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();

        if path.is_file() && file_name == name {
            return Some(path);
        }
        if path.is_dir() && file_name != "node_modules" && !file_name.starts_with('.') {
            subdirs.push(path);
        }
    }

    subdirs
        .into_iter()
        .find_map(|subdir| find_file(&subdir, name, depth + 1))
}

/// Pulls the settings module out of
/// `os.environ.setdefault("DJANGO_SETTINGS_MODULE", "myproj.settings")`:
/// the key, a comma, then the next quoted string.
pub fn settings_module_from_manage_py(content: &str) -> Option<String> {
    let key_at = content.find("DJANGO_SETTINGS_MODULE")?;
    let rest = &content[key_at + "DJANGO_SETTINGS_MODULE".len()..];
    let comma = rest.find(',')?;
    let rest = &rest[comma + 1..];

    let open = rest.find(['"', '\''])?;
    let quote = rest.as_bytes()[open] as char;
    let rest = &rest[open + 1..];
    let close = rest.find(quote)?;

    let module = &rest[..close];
    (!module.is_empty()).then(|| module.to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write(dir: &TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn detects_flask_service() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "flask==3.0.0\n");
        write(&dir, "app.py", "app = Flask(__name__)\n");

        let detection = ProjectDetector::new(dir.path()).detect();
        assert_eq!(detection.kind, DeploymentKind::Service);
        assert_eq!(detection.runtime, Runtime::Python);
        assert_eq!(detection.framework, Framework::Flask);
        assert_eq!(detection.config.port, Some(5000));
        assert_eq!(
            detection.config.start_command.as_deref(),
            Some("python app.py")
        );
    }

    #[test]
    fn detects_django_with_gunicorn() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "Django==4.2\ngunicorn==21.2.0\n");
        write(
            &dir,
            "manage.py",
            "os.environ.setdefault(\"DJANGO_SETTINGS_MODULE\", \"myproj.settings\")\n",
        );

        let detection = ProjectDetector::new(dir.path()).detect();
        assert_eq!(detection.framework, Framework::Django);
        assert_eq!(detection.config.port, Some(8000));
        assert_eq!(
            detection.config.start_command.as_deref(),
            Some("gunicorn myproj.wsgi:application --bind 0.0.0.0:8000")
        );
    }

    #[test]
    fn django_project_name_prefers_wsgi_parent() {
        let dir = TempDir::new().unwrap();
        write(&dir, "manage.py", "");
        write(&dir, "mysite/wsgi.py", "application = get_wsgi_application()\n");
        write(&dir, "requirements.txt", "django\ngunicorn\n");

        let detector = ProjectDetector::new(dir.path());
        assert_eq!(detector.django_project_name().as_deref(), Some("mysite"));
    }

    #[test]
    fn detects_vite_static_site() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "package.json",
            r#"{"dependencies": {"vite": "^5.0.0"}, "scripts": {"build": "vite build"}}"#,
        );

        let detection = ProjectDetector::new(dir.path()).detect();
        assert_eq!(detection.kind, DeploymentKind::Static);
        assert_eq!(detection.framework, Framework::ReactVite);
        assert_eq!(detection.config.publish_dir.as_deref(), Some("dist"));
        assert_eq!(
            detection.config.build_command.as_deref(),
            Some("npm install && npm run build")
        );
    }

    #[test]
    fn detects_express_service() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "package.json",
            r#"{"dependencies": {"express": "^4"}, "scripts": {"start": "node server.js"}}"#,
        );

        let detection = ProjectDetector::new(dir.path()).detect();
        assert_eq!(detection.kind, DeploymentKind::Service);
        assert_eq!(detection.framework, Framework::Express);
        assert_eq!(detection.config.start_command.as_deref(), Some("npm start"));
        assert_eq!(detection.config.port, Some(3000));
    }

    #[test]
    fn bare_html_falls_back_to_static() {
        let dir = TempDir::new().unwrap();
        write(&dir, "index.html", "<html></html>");

        let detection = ProjectDetector::new(dir.path()).detect();
        assert_eq!(detection.kind, DeploymentKind::Static);
        assert_eq!(detection.runtime, Runtime::Static);
        assert_eq!(detection.framework, Framework::Html);
        assert_eq!(detection.config.publish_dir.as_deref(), Some("."));
    }

    #[test]
    fn empty_directory_falls_back_to_static() {
        let dir = TempDir::new().unwrap();
        let detection = ProjectDetector::new(dir.path()).detect();
        assert_eq!(detection.kind, DeploymentKind::Static);
        assert_eq!(detection.runtime, Runtime::Static);
    }

    #[test]
    fn detection_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "fastapi\nuvicorn\n");
        write(&dir, "main.py", "app = FastAPI()\n");

        let first = ProjectDetector::new(dir.path()).detect();
        let second = ProjectDetector::new(dir.path()).detect();
        assert_eq!(first.framework, second.framework);
        assert_eq!(first.config, second.config);
        assert_eq!(first.framework, Framework::Fastapi);
    }

    #[test]
    fn settings_module_parsing() {
        let content = r#"os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'blog.settings')"#;
        assert_eq!(
            settings_module_from_manage_py(content).as_deref(),
            Some("blog.settings")
        );
        assert_eq!(settings_module_from_manage_py("no django here"), None);
    }
}
