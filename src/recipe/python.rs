//! Python service recipes. Flask/FastAPI/generic apps get a slim image with
//! their dependencies installed and a command picked from what the
//! requirements declare. Django additionally gets a runtime wrapper (migrate
//! + collectstatic before the server) and a generated settings override
//! placed next to the project package.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::detector::{find_file, settings_module_from_manage_py};
use crate::error::Result;
use crate::persistence::{DeployConfig, Runtime};
use crate::recipe::{
    build_steps, command_json_array, derive_name, labels_for, sh_command_json, volume_for,
    Recipe, ENV_FILE_PREFIX, VOLUME_BIND_PATH,
};

const DEFAULT_REQUIREMENTS: &str = "Flask==3.0.0\ngunicorn==21.2.0\n";

const BUILD_IGNORE: &str = "__pycache__/
*.pyc
*.pyo
*.pyd
.Python
*.egg
*.egg-info/
dist/
build/
venv/
env/
.venv
ENV/
.git/
.gitignore
.vscode/
.idea/
.DS_Store
*.log
.pytest_cache/
.coverage
htmlcov/
.tox/
.mypy_cache/
.ruff_cache/
README.md
docs/
tests/
";

/// Startup wrapper for Django: run migrations and collect static files, both
/// as non-fatal warnings, then hand over to the server command.
const DJANGO_PRE_START: &str = "mkdir -p /app/data /app/data/staticfiles /app/data/media && \
echo '=== Django Startup ===' && \
echo 'Running migrations...' && python manage.py migrate --noinput 2>&1 || \
echo 'Warning: migrations failed, continuing anyway' && \
echo 'Collecting static files...' && python manage.py collectstatic --noinput 2>&1 || \
echo 'Warning: collectstatic failed, continuing anyway' && \
echo 'Starting server...' && ";

pub(crate) fn synthesize(
    root: &Path,
    config: &DeployConfig,
    deployment_id: &str,
    version: i64,
) -> Result<Recipe> {
    let port = config.port.unwrap_or(5000);
    let entry_file = config.entry_file.as_deref().unwrap_or("app.py");
    let mut aux_files = Vec::new();

    let has_requirements = root.join("requirements.txt").exists();
    let has_pipfile = root.join("Pipfile").exists();

    let requirements = if has_requirements {
        fs::read_to_string(root.join("requirements.txt"))
            .unwrap_or_default()
            .to_lowercase()
    } else if has_pipfile {
        String::new()
    } else {
        // No dependency manifest at all; seed a minimal one so the image
        // still builds.
        aux_files.push(("requirements.txt".to_string(), DEFAULT_REQUIREMENTS.to_string()));
        DEFAULT_REQUIREMENTS.to_lowercase()
    };
    let pipfile = if has_pipfile {
        fs::read_to_string(root.join("Pipfile"))
            .unwrap_or_default()
            .to_lowercase()
    } else {
        String::new()
    };

    let manage_py = find_file(root, "manage.py", 0);
    let is_django =
        requirements.contains("django") || pipfile.contains("django") || manage_py.is_some();

    let settings_module = manage_py
        .as_deref()
        .and_then(|manage| django_settings_module(root, manage));
    let project_name = settings_module
        .as_deref()
        .map(|module| module.split('.').next().unwrap_or(module).to_string());

    let has_gunicorn = requirements.contains("gunicorn");

    // Work out the final container command.
    let start_command = config
        .start_command
        .as_deref()
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty());

    let cmd_json = if let Some(custom) = start_command {
        if is_django {
            sh_command_json(&format!("{ENV_FILE_PREFIX}{DJANGO_PRE_START}{custom}"))
        } else {
            command_json_array(custom)
        }
    } else if is_django {
        let server = match (&project_name, has_gunicorn) {
            (Some(project), true) => format!(
                "gunicorn {project}.wsgi:application --bind 0.0.0.0:{port} --workers 3 --timeout 120"
            ),
            _ => procfile_web_command(root)
                .unwrap_or_else(|| format!("python manage.py runserver 0.0.0.0:{port}")),
        };
        debug!(%server, "django server command");
        sh_command_json(&format!("{ENV_FILE_PREFIX}{DJANGO_PRE_START}{server}"))
    } else if requirements.contains("fastapi") || requirements.contains("uvicorn") {
        format!(r#"["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "{port}"]"#)
    } else if has_gunicorn {
        let app = entry_file.trim_end_matches(".py");
        format!(r#"["gunicorn", "--bind", "0.0.0.0:{port}", "{app}:app"]"#)
    } else if requirements.contains("flask") {
        format!(r#"["python", "-m", "flask", "run", "--host=0.0.0.0", "--port={port}"]"#)
    } else {
        format!(r#"["python", "{entry_file}"]"#)
    };

    // Django gets a settings override next to the project package.
    let mut django_env = String::new();
    let mut make_data_dirs = "";
    if is_django {
        if let Some(project) = &project_name {
            aux_files.push((
                format!("{project}/settings_local.py"),
                SETTINGS_LOCAL_TEMPLATE.replace("__PROJECT__", project),
            ));
            django_env = format!("\nENV DJANGO_SETTINGS_MODULE={project}.settings_local");
            make_data_dirs = "\nRUN mkdir -p /app/data/staticfiles /app/data/media || true";
        }
    }

    let build_command = config
        .build_command
        .as_deref()
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty());

    let install_deps = match build_command {
        Some(cmd) if cmd.to_lowercase().contains("pip install") => {
            "\n# Copy requirements first for layer reuse\nCOPY requirements.txt* Pipfile* ./\n"
                .to_string()
        }
        _ => r#"
# Copy requirements first for layer reuse
COPY requirements.txt* Pipfile* ./
RUN if [ -f requirements.txt ]; then \
    pip install --no-cache-dir --upgrade pip && pip install --no-cache-dir -r requirements.txt; \
elif [ -f Pipfile ]; then \
    pip install --no-cache-dir --upgrade pip pipenv && pipenv install --deploy --system; \
fi
"#
        .to_string(),
    };

    let custom_build = match build_command {
        Some(cmd) => format!("\n# Custom build command\nRUN {}\n", build_steps(cmd)),
        None => String::new(),
    };

    let dockerfile = format!(
        r#"FROM python:3.11-slim
WORKDIR /app

RUN apt-get update && apt-get install -y --no-install-recommends \
    git \
    gcc \
    python3-dev \
    libpq-dev \
    pkg-config \
  && rm -rf /var/lib/apt/lists/*
{install_deps}
COPY . .
{custom_build}{make_data_dirs}
EXPOSE {port}

ENV FLASK_APP={entry_file}
ENV FLASK_RUN_HOST=0.0.0.0
ENV FLASK_RUN_PORT={port}
ENV PYTHONUNBUFFERED=1
ENV PORT={port}{django_env}

HEALTHCHECK --interval=30s --timeout=10s --start-period=40s --retries=3 CMD python -c "import socket; s=socket.socket(); s.connect(('localhost', {port})); s.close()" || exit 1

CMD {cmd_json}
"#
    );

    // Run-time environment. User-provided variables win.
    let mut env = std::collections::BTreeMap::from([
        ("PORT".to_string(), port.to_string()),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ("FLASK_APP".to_string(), entry_file.to_string()),
        ("FLASK_RUN_HOST".to_string(), "0.0.0.0".to_string()),
        ("FLASK_RUN_PORT".to_string(), port.to_string()),
    ]);
    if is_django && !config.has_env("DJANGO_SETTINGS_MODULE") {
        let module = match &project_name {
            Some(project) => format!("{project}.settings_local"),
            None => "settings".to_string(),
        };
        env.insert("DJANGO_SETTINGS_MODULE".to_string(), module);
    }
    if is_django && config.persistent_storage && !config.has_env("DATABASE_URL") {
        env.insert(
            "DATABASE_URL".to_string(),
            format!("sqlite:///{VOLUME_BIND_PATH}/db.sqlite3"),
        );
    }
    env.extend(config.env_map());

    let name = derive_name("web", deployment_id, version);

    Ok(Recipe {
        dockerfile,
        build_ignore: BUILD_IGNORE.to_string(),
        aux_files,
        image_tag: name.clone(),
        container_name: name,
        container_port: port,
        env,
        labels: labels_for("web-service", Some(Runtime::Python), deployment_id),
        volume: volume_for(config, deployment_id),
        auto_restart: config.auto_restart,
        startup_grace: Duration::from_secs(if is_django { 40 } else { 30 }),
    })
}

/// Settings module, e.g. `myproj.settings`, read from manage.py or located by
/// finding a directory that holds a settings.py.
fn django_settings_module(root: &Path, manage_py: &Path) -> Option<String> {
    if let Ok(content) = fs::read_to_string(manage_py) {
        if let Some(module) = settings_module_from_manage_py(&content) {
            return Some(module);
        }
    }

    let settings = find_file(root, "settings.py", 0)?;
    let package = settings.parent()?.strip_prefix(root).ok()?;
    let dotted = package
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join(".");
    (!dotted.is_empty()).then(|| format!("{dotted}.settings"))
}

/// A `web:` line in a Procfile overrides the default Django command.
fn procfile_web_command(root: &Path) -> Option<String> {
    let procfile = fs::read_to_string(root.join("Procfile")).ok()?;
    procfile.lines().find_map(|line| {
        line.trim()
            .strip_prefix("web:")
            .map(|cmd| cmd.trim().to_string())
            .filter(|cmd| !cmd.is_empty())
    })
}

const SETTINGS_LOCAL_TEMPLATE: &str = r#"import os

# Give DATABASE_URL a value before the project settings import so url
# parsing in user settings cannot blow up.
if not os.environ.get('DATABASE_URL', '').strip():
    os.environ['DATABASE_URL'] = 'sqlite:////app/data/db.sqlite3'

from __PROJECT__.settings import *  # noqa: F401,F403

DEBUG = os.environ.get('DEBUG', 'True').lower() in ('true', '1', 'yes')
ALLOWED_HOSTS = os.environ['ALLOWED_HOSTS'].split(',') if os.environ.get('ALLOWED_HOSTS') else ['*']

database_url = os.environ.get('DATABASE_URL', '').strip()
if database_url.startswith('sqlite'):
    # sqlite://// is an absolute path, sqlite:/// a relative one.
    if database_url.startswith('sqlite:////'):
        db_path = database_url.replace('sqlite:////', '/')
    elif database_url.startswith('sqlite:///'):
        db_path = database_url.replace('sqlite:///', '')
    else:
        db_path = database_url.replace('sqlite://', '')
    db_dir = os.path.dirname(db_path)
    if db_dir and not os.path.exists(db_dir):
        os.makedirs(db_dir, exist_ok=True)
    DATABASES = {'default': {'ENGINE': 'django.db.backends.sqlite3', 'NAME': db_path}}
else:
    try:
        import dj_database_url
        DATABASES = {'default': dj_database_url.parse(database_url, conn_max_age=600, ssl_require=False)}
    except Exception:
        db_path = '/app/data/db.sqlite3'
        os.makedirs(os.path.dirname(db_path), exist_ok=True)
        DATABASES = {'default': {'ENGINE': 'django.db.backends.sqlite3', 'NAME': db_path}}

STATIC_ROOT = '/app/data/staticfiles'
MEDIA_ROOT = '/app/data/media'

try:
    import whitenoise  # noqa: F401
    if 'whitenoise.middleware.WhiteNoiseMiddleware' not in MIDDLEWARE:
        try:
            index = MIDDLEWARE.index('django.middleware.security.SecurityMiddleware')
            MIDDLEWARE.insert(index + 1, 'whitenoise.middleware.WhiteNoiseMiddleware')
        except ValueError:
            MIDDLEWARE.insert(0, 'whitenoise.middleware.WhiteNoiseMiddleware')
    STATICFILES_STORAGE = 'whitenoise.storage.CompressedManifestStaticFilesStorage'
except ImportError:
    pass

if 'SECRET_KEY' in os.environ:
    SECRET_KEY = os.environ['SECRET_KEY']
elif not globals().get('SECRET_KEY'):
    import secrets
    SECRET_KEY = secrets.token_urlsafe(50)

if not globals().get('WSGI_APPLICATION'):
    WSGI_APPLICATION = '__PROJECT__.wsgi.application'
"#;

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
    fn flask_without_gunicorn_uses_flask_run() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "flask\n");
        write(&dir, "app.py", "app = Flask(__name__)\n");

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "dep1", 1).unwrap();
        assert_eq!(recipe.container_port, 5000);
        assert!(recipe.dockerfile.contains(
            r#"CMD ["python", "-m", "flask", "run", "--host=0.0.0.0", "--port=5000"]"#
        ));
        assert!(recipe
            .dockerfile
            .contains("s.connect(('localhost', 5000))"));
        assert_eq!(recipe.env.get("PORT").unwrap(), "5000");
        assert_eq!(recipe.labels.get("runtime").unwrap(), "python");
    }

    #[test]
    fn fastapi_prefers_uvicorn() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "fastapi\nuvicorn\n");
        write(&dir, "main.py", "app = FastAPI()\n");

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "dep1", 1).unwrap();
        assert!(recipe
            .dockerfile
            .contains(r#"CMD ["uvicorn", "main:app", "--host", "0.0.0.0", "--port", "5000"]"#));
    }

    #[test]
    fn django_with_gunicorn_and_persistent_storage() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "Django==4.2\ngunicorn\n");
        write(
            &dir,
            "manage.py",
            "os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'myproj.settings')\n",
        );

        let config = DeployConfig {
            port: Some(8000),
            persistent_storage: true,
            volume_name: Some("persistent_data_dep1".to_string()),
            ..Default::default()
        };
        let recipe = synthesize(dir.path(), &config, "dep1", 1).unwrap();

        assert!(recipe.dockerfile.contains(
            "gunicorn myproj.wsgi:application --bind 0.0.0.0:8000 --workers 3 --timeout 120"
        ));
        assert!(recipe.dockerfile.contains("migrate --noinput"));
        assert!(recipe.dockerfile.contains("collectstatic --noinput"));
        assert!(recipe
            .dockerfile
            .contains("ENV DJANGO_SETTINGS_MODULE=myproj.settings_local"));

        let settings = recipe
            .aux_files
            .iter()
            .find(|(path, _)| path == "myproj/settings_local.py")
            .map(|(_, content)| content)
            .unwrap();
        assert!(settings.contains("from myproj.settings import *"));
        assert!(settings.contains("STATIC_ROOT = '/app/data/staticfiles'"));
        assert!(settings.contains("WSGI_APPLICATION = 'myproj.wsgi.application'"));

        assert_eq!(
            recipe.env.get("DATABASE_URL").unwrap(),
            "sqlite:////app/data/db.sqlite3"
        );
        assert_eq!(recipe.volume.as_ref().unwrap().name, "persistent_data_dep1");
        assert_eq!(recipe.volume.as_ref().unwrap().bind, "/app/data");
        assert_eq!(recipe.startup_grace, Duration::from_secs(40));
    }

    #[test]
    fn django_without_gunicorn_falls_back_to_runserver() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "django\n");
        write(
            &dir,
            "manage.py",
            "os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'blog.settings')\n",
        );

        let config = DeployConfig {
            port: Some(8000),
            ..Default::default()
        };
        let recipe = synthesize(dir.path(), &config, "dep1", 1).unwrap();
        assert!(recipe
            .dockerfile
            .contains("python manage.py runserver 0.0.0.0:8000"));
    }

    #[test]
    fn procfile_overrides_the_django_default() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "django\n");
        write(
            &dir,
            "manage.py",
            "os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'blog.settings')\n",
        );
        write(&dir, "Procfile", "web: daphne blog.asgi:application\n");

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "dep1", 1).unwrap();
        assert!(recipe.dockerfile.contains("daphne blog.asgi:application"));
    }

    #[test]
    fn missing_manifest_seeds_requirements() {
        let dir = TempDir::new().unwrap();
        write(&dir, "app.py", "print('hi')\n");

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "dep1", 1).unwrap();
        assert!(recipe
            .aux_files
            .iter()
            .any(|(path, content)| path == "requirements.txt" && content.contains("Flask")));
    }

    #[test]
    fn user_environment_wins() {
        let dir = TempDir::new().unwrap();
        write(&dir, "requirements.txt", "django\ngunicorn\n");
        write(
            &dir,
            "manage.py",
            "os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'myproj.settings')\n",
        );

        let config = DeployConfig {
            persistent_storage: true,
            environment_variables: vec![
                crate::persistence::EnvVar {
                    key: "DATABASE_URL".to_string(),
                    value: "postgres://db/example".to_string(),
                },
                crate::persistence::EnvVar {
                    key: "DJANGO_SETTINGS_MODULE".to_string(),
                    value: "myproj.settings".to_string(),
                },
            ],
            ..Default::default()
        };
        let recipe = synthesize(dir.path(), &config, "dep1", 1).unwrap();
        assert_eq!(
            recipe.env.get("DATABASE_URL").unwrap(),
            "postgres://db/example"
        );
        assert_eq!(
            recipe.env.get("DJANGO_SETTINGS_MODULE").unwrap(),
            "myproj.settings"
        );
    }
}
