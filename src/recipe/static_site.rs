//! Two-stage recipe for static sites: a node build stage that produces the
//! publish directory, then a slim nginx stage that serves it with SPA
//! fallback, gzip and long-lived caching for fingerprinted assets.

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::persistence::DeployConfig;
use crate::recipe::{
    build_steps, derive_name, labels_for, node_version, rewrite_npm_install, volume_for, Recipe,
};

const DEFAULT_BUILD_COMMAND: &str = "npm install && npm run build";

const NGINX_CONF: &str = r#"server {
    listen 80;
    listen [::]:80;

    root /usr/share/nginx/html;
    index index.html index.htm;

    include /etc/nginx/mime.types;
    default_type application/octet-stream;

    gzip on;
    gzip_vary on;
    gzip_min_length 1024;
    gzip_types text/plain text/css text/xml text/javascript application/javascript application/json application/xml+rss font/truetype font/opentype image/svg+xml;

    location / {
        try_files $uri $uri/ /index.html;
        add_header X-Frame-Options "SAMEORIGIN" always;
        add_header X-Content-Type-Options "nosniff" always;
        add_header Access-Control-Allow-Origin "*" always;
    }

    location ~* \.css$ {
        add_header Content-Type "text/css" always;
        add_header Cache-Control "public, max-age=31536000" always;
    }

    location ~* \.(js|mjs|jsx)$ {
        add_header Content-Type "application/javascript" always;
        add_header Cache-Control "public, max-age=31536000" always;
    }

    location ~* \.(jpg|jpeg|png|gif|ico|svg|webp)$ {
        add_header Cache-Control "public, max-age=31536000" always;
    }

    error_page 404 /index.html;
}"#;

const BUILD_IGNORE: &str = "node_modules/
npm-debug.log
yarn-error.log
package-lock.json
yarn.lock
.git/
.gitignore
.vscode/
.idea/
*.swp
.DS_Store
Thumbs.db
.env
.env.local
*.log
.cache/
.next/
.nuxt/
.output/
dist-ssr/
README.md
docs/
coverage/
.nyc_output/
";

pub(crate) fn synthesize(
    root: &Path,
    config: &DeployConfig,
    deployment_id: &str,
    version: i64,
) -> Result<Recipe> {
    let has_package_json = root.join("package.json").exists();

    let (build_command, publish_dir) = if has_package_json {
        let build_command = config
            .build_command
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or(DEFAULT_BUILD_COMMAND);
        let publish_dir = config.publish_dir.as_deref().unwrap_or("dist");
        (rewrite_npm_install(build_command), publish_dir)
    } else {
        // Nothing to build, serve the tree as-is.
        (
            "echo \"No build needed for static HTML\"".to_string(),
            ".",
        )
    };

    let dockerfile = if has_package_json {
        let node = node_version(root, 22);
        let build = build_steps(&build_command);
        format!(
            r#"# Build stage
FROM node:{node}-alpine as builder
WORKDIR /app

# Install dependencies first for layer reuse
COPY package*.json ./
RUN npm install --legacy-peer-deps --loglevel=error || npm install --force --loglevel=error || npm install --loglevel=error

COPY . .

RUN {build}

# If the build did not leave an index.html in the publish directory, promote
# the first html file found near the top to index.html, or give up loudly.
RUN if [ ! -f {publish_dir}/index.html ]; then \
  echo "index.html not found in {publish_dir}/, searching for alternative HTML files..." && \
  HTML_FILE=$(find {publish_dir} -maxdepth 2 -type f -name "*.html" | head -n 1) && \
  if [ -n "$HTML_FILE" ]; then \
    echo "Found $(basename "$HTML_FILE"), copying to index.html" && \
    cp "$HTML_FILE" {publish_dir}/index.html; \
  else \
    echo "ERROR: no HTML files found in {publish_dir}/" && \
    ls -la {publish_dir}/ && \
    exit 1; \
  fi; \
fi

# Runtime stage
FROM nginx:alpine

COPY --from=builder /app/{publish_dir} /usr/share/nginx/html/
COPY --from=builder /app/default.conf /etc/nginx/conf.d/default.conf

EXPOSE 80

HEALTHCHECK --interval=30s --timeout=3s --start-period=5s --retries=3 \
  CMD wget --quiet --tries=1 --spider http://localhost:80/ || exit 1

CMD ["nginx", "-g", "daemon off;"]
"#
        )
    } else {
        r#"FROM nginx:alpine
WORKDIR /usr/share/nginx/html

COPY . .

COPY default.conf /etc/nginx/conf.d/default.conf

RUN if [ ! -f /usr/share/nginx/html/index.html ]; then \
  echo "index.html not found, searching for alternative HTML files..." && \
  HTML_FILE=$(find /usr/share/nginx/html -maxdepth 2 -type f -name "*.html" | head -n 1) && \
  if [ -n "$HTML_FILE" ]; then \
    echo "Found $(basename "$HTML_FILE"), copying to index.html" && \
    cp "$HTML_FILE" /usr/share/nginx/html/index.html; \
  else \
    echo "ERROR: no HTML files found" && \
    ls -la /usr/share/nginx/html/ && \
    exit 1; \
  fi; \
fi

EXPOSE 80

HEALTHCHECK --interval=30s --timeout=3s --start-period=5s --retries=3 \
  CMD wget --quiet --tries=1 --spider http://localhost:80/ || exit 1

CMD ["nginx", "-g", "daemon off;"]
"#
        .to_string()
    };

    let name = derive_name("deploy", deployment_id, version);

    Ok(Recipe {
        dockerfile,
        build_ignore: BUILD_IGNORE.to_string(),
        aux_files: vec![("default.conf".to_string(), NGINX_CONF.to_string())],
        image_tag: name.clone(),
        container_name: name,
        container_port: 80,
        env: Default::default(),
        labels: labels_for("static", None, deployment_id),
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
    fn vite_spa_recipe() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"vite": "^5"}, "scripts": {"build": "vite build"}}"#,
        )
        .unwrap();

        let recipe = synthesize(
            dir.path(),
            &DeployConfig {
                build_command: Some("npm install && npm run build".to_string()),
                publish_dir: Some("dist".to_string()),
                ..Default::default()
            },
            "abc123",
            1,
        )
        .unwrap();

        assert!(recipe.dockerfile.contains("FROM node:22-alpine as builder"));
        assert!(recipe
            .dockerfile
            .contains("npm install --legacy-peer-deps && \\\n    npm run build"));
        assert!(recipe
            .dockerfile
            .contains("COPY --from=builder /app/dist /usr/share/nginx/html/"));
        assert_eq!(recipe.container_port, 80);
        assert_eq!(recipe.labels.get("type").unwrap(), "static");
        assert_eq!(recipe.image_tag, "deploy-abc123-v1");

        let (name, conf) = &recipe.aux_files[0];
        assert_eq!(name, "default.conf");
        assert!(conf.contains("try_files $uri $uri/ /index.html;"));
        assert!(conf.contains("gzip on;"));
    }

    #[test]
    fn engines_pin_the_build_image() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"engines": {"node": "16"}, "scripts": {"build": "webpack"}}"#,
        )
        .unwrap();

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "abc123", 1).unwrap();
        assert!(recipe.dockerfile.contains("FROM node:16-alpine as builder"));
    }

    #[test]
    fn bare_html_skips_the_build_stage() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "abc123", 1).unwrap();
        assert!(!recipe.dockerfile.contains("as builder"));
        assert!(recipe.dockerfile.starts_with("FROM nginx:alpine"));
    }
}
