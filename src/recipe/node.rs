//! Node.js service recipes. Production builds run on an Alpine image matched
//! to `engines.node`, install with yarn or npm, and fall through a chain of
//! start commands. Dev mode installs dev dependencies and runs `npm run dev`
//! with hot reload.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::persistence::{DeployConfig, Runtime};
use crate::recipe::{
    build_steps, command_json_array, derive_name, labels_for, node_version, rewrite_npm_install,
    sh_command_json, volume_for, Recipe, ENV_FILE_PREFIX,
};

const BUILD_IGNORE: &str = "node_modules/
npm-debug.log
yarn-error.log
.git/
.gitignore
.vscode/
.idea/
.DS_Store
*.log
.env
.env.local
.next/
.nuxt/
dist/
build/
coverage/
README.md
docs/
";

const DEFAULT_INSTALL: &str = r#"
# Install dependencies, preferring the lockfile's package manager
RUN if [ -f yarn.lock ]; then \
  (command -v yarn >/dev/null 2>&1 || npm i -g yarn) && yarn install --prod || yarn install; \
elif [ -f package.json ]; then \
  npm install --production --loglevel=error --ignore-scripts || \
  npm install --loglevel=error --ignore-scripts; \
fi
"#;

pub(crate) fn synthesize(
    root: &Path,
    config: &DeployConfig,
    deployment_id: &str,
    version: i64,
) -> Result<Recipe> {
    let port = config.port.unwrap_or(3000);
    let entry_file = config.entry_file.as_deref().unwrap_or("index.js");

    let start_command = config
        .start_command
        .as_deref()
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty());

    let cmd_json = match start_command {
        Some(custom) => command_json_array(custom),
        None => {
            // Try the declared start script, then the conventional entry
            // files, then whatever the config names.
            let chain = format!(
                "if [ -f package.json ] && (npm run | grep -q ' start'); then npm start; \
elif command -v yarn >/dev/null 2>&1 && [ -f package.json ] && (yarn run | grep -q ' start'); then yarn start; \
elif [ -f server.js ]; then node server.js; \
elif [ -f app.js ]; then node app.js; \
elif [ -f index.js ]; then node index.js; \
else node {entry_file}; fi"
            );
            sh_command_json(&format!("{ENV_FILE_PREFIX}{chain}"))
        }
    };
    debug!(%cmd_json, "node start command");

    let custom_build = match config
        .build_command
        .as_deref()
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
    {
        Some(cmd) => format!(
            "\n# Custom build command\nRUN {}\n",
            build_steps(&rewrite_npm_install(cmd))
        ),
        None => DEFAULT_INSTALL.to_string(),
    };

    let node = node_version(root, 18);

    let dockerfile = format!(
        r#"FROM node:{node}-alpine
WORKDIR /app

COPY . .
{custom_build}
EXPOSE {port}

ENV PORT={port}
ENV NODE_ENV=production

HEALTHCHECK --interval=30s --timeout=10s --start-period=30s --retries=3 \
  CMD node -e "require('http').get('http://localhost:{port}', (r) => {{r.statusCode === 200 ? process.exit(0) : process.exit(1)}})" || exit 1

CMD {cmd_json}
"#
    );

    let mut env = std::collections::BTreeMap::from([
        ("PORT".to_string(), port.to_string()),
        ("NODE_ENV".to_string(), "production".to_string()),
    ]);
    env.extend(config.env_map());

    let name = derive_name("web", deployment_id, version);

    Ok(Recipe {
        dockerfile,
        build_ignore: BUILD_IGNORE.to_string(),
        aux_files: Vec::new(),
        image_tag: name.clone(),
        container_name: name,
        container_port: port,
        env,
        labels: labels_for("web-service", Some(Runtime::Nodejs), deployment_id),
        volume: volume_for(config, deployment_id),
        auto_restart: config.auto_restart,
        startup_grace: Duration::from_secs(15),
    })
}

/// Dev mode: the full (non-alpine) image, dev dependencies included, running
/// the project's own `dev` script.
pub(crate) fn synthesize_dev(
    root: &Path,
    config: &DeployConfig,
    deployment_id: &str,
    version: i64,
) -> Result<Recipe> {
    let port = config.port.unwrap_or(3000);

    let package: Value = fs::read_to_string(root.join("package.json"))
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .ok_or_else(|| Error::Build("package.json not found for dev mode deployment".to_string()))?;

    let dev_script = package
        .get("scripts")
        .and_then(|scripts| scripts.get("dev"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Build("No 'dev' script found in package.json".to_string()))?;
    debug!(%dev_script, "dev mode script");

    let node = node_version(root, 20);

    let dockerfile = format!(
        r#"FROM node:{node}
WORKDIR /app

COPY package*.json ./

# Install everything, dev dependencies included
RUN npm install --loglevel=error || npm install --legacy-peer-deps --loglevel=error

COPY . .

EXPOSE {port}

ENV PORT={port}
ENV NODE_ENV=development

CMD ["npm", "run", "dev"]
"#
    );

    let mut env = std::collections::BTreeMap::from([
        ("PORT".to_string(), port.to_string()),
        ("NODE_ENV".to_string(), "development".to_string()),
    ]);
    env.extend(config.env_map());

    let name = derive_name("dev", deployment_id, version);

    Ok(Recipe {
        dockerfile,
        build_ignore: BUILD_IGNORE.to_string(),
        aux_files: Vec::new(),
        image_tag: name.clone(),
        container_name: name,
        container_port: port,
        env,
        labels: labels_for("web-service-dev", Some(Runtime::Nodejs), deployment_id),
        volume: volume_for(config, deployment_id),
        auto_restart: config.auto_restart,
        startup_grace: Duration::from_secs(15),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn production_recipe_with_start_chain() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"express": "^4"}}"#,
        )
        .unwrap();

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "dep1", 1).unwrap();
        assert!(recipe.dockerfile.contains("FROM node:18-alpine"));
        assert!(recipe.dockerfile.contains("node server.js"));
        assert!(recipe.dockerfile.contains("if [ -f .env ]"));
        assert_eq!(recipe.env.get("NODE_ENV").unwrap(), "production");
        assert_eq!(recipe.labels.get("type").unwrap(), "web-service");
    }

    #[test]
    fn custom_start_command_is_exec_form() {
        let dir = TempDir::new().unwrap();
        let config = DeployConfig {
            start_command: Some("node dist/main.js".to_string()),
            ..Default::default()
        };
        let recipe = synthesize(dir.path(), &config, "dep1", 1).unwrap();
        assert!(recipe
            .dockerfile
            .contains(r#"CMD ["node", "dist/main.js"]"#));
    }

    #[test]
    fn engines_pick_the_runtime_image() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"engines": {"node": ">=22"}}"#,
        )
        .unwrap();

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "dep1", 1).unwrap();
        assert!(recipe.dockerfile.contains("FROM node:22-alpine"));
    }

    #[test]
    fn dev_mode_runs_the_dev_script() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite"}}"#,
        )
        .unwrap();

        let config = DeployConfig {
            use_dev_mode: true,
            ..Default::default()
        };
        let recipe = synthesize_dev(dir.path(), &config, "dep1", 1).unwrap();
        assert!(recipe.dockerfile.contains(r#"CMD ["npm", "run", "dev"]"#));
        assert!(recipe.dockerfile.contains("ENV NODE_ENV=development"));
        assert_eq!(recipe.labels.get("type").unwrap(), "web-service-dev");
        assert_eq!(recipe.env.get("NODE_ENV").unwrap(), "development");
        assert_eq!(recipe.image_tag, "dev-dep1-v1");
    }

    #[test]
    fn dev_mode_without_dev_script_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("package.json"), r#"{"scripts": {}}"#).unwrap();

        let config = DeployConfig {
            use_dev_mode: true,
            ..Default::default()
        };
        let err = synthesize_dev(dir.path(), &config, "dep1", 1).unwrap_err();
        assert!(err.to_string().contains("dev"));
    }
}
