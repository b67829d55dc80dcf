//! Java service recipes: a two-stage Maven or Gradle build when a build file
//! is present, otherwise a single stage around a pre-built JAR. The runtime
//! image is always a JRE-only Alpine.

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::persistence::{DeployConfig, Runtime};
use crate::recipe::{derive_name, labels_for, volume_for, Recipe};

const BUILD_IGNORE: &str = "target/
build/
.gradle/
.git/
.gitignore
.vscode/
.idea/
*.iml
.DS_Store
*.log
README.md
docs/
";

enum BuildTool {
    Maven,
    Gradle,
    PrebuiltJar,
}

pub(crate) fn synthesize(
    root: &Path,
    config: &DeployConfig,
    deployment_id: &str,
    version: i64,
) -> Result<Recipe> {
    let port = config.port.unwrap_or(8080);
    let entry_jar = config.entry_file.as_deref().unwrap_or("app.jar");

    let build_tool = if root.join("pom.xml").exists() {
        BuildTool::Maven
    } else if root.join("build.gradle").exists() || root.join("build.gradle.kts").exists() {
        BuildTool::Gradle
    } else {
        BuildTool::PrebuiltJar
    };

    let dockerfile = match build_tool {
        BuildTool::Maven => format!(
            r#"# Build stage
FROM maven:3.9-eclipse-temurin-17 AS builder
WORKDIR /app

# Resolve dependencies first for layer reuse
COPY pom.xml .
RUN mvn dependency:go-offline -B

COPY src ./src
RUN mvn clean package -DskipTests -B

# Runtime stage
FROM eclipse-temurin:17-jre-alpine
WORKDIR /app

COPY --from=builder /app/target/*.jar app.jar

EXPOSE {port}

ENV JAVA_OPTS="-Xmx512m -Xms256m"
ENV SERVER_PORT={port}

HEALTHCHECK --interval=30s --timeout=10s --start-period=60s --retries=3 \
  CMD wget --quiet --tries=1 --spider http://localhost:{port}/actuator/health || \
      wget --quiet --tries=1 --spider http://localhost:{port}/ || exit 1

ENTRYPOINT ["sh", "-c", "java $JAVA_OPTS -Dserver.port=$SERVER_PORT -jar app.jar"]
"#
        ),
        BuildTool::Gradle => format!(
            r#"# Build stage
FROM gradle:8.5-jdk17 AS builder
WORKDIR /app

COPY build.gradle* settings.gradle* gradlew ./
COPY gradle ./gradle

RUN gradle dependencies --no-daemon || true

COPY src ./src
RUN gradle bootJar --no-daemon -x test

# Runtime stage
FROM eclipse-temurin:17-jre-alpine
WORKDIR /app

COPY --from=builder /app/build/libs/*.jar app.jar

EXPOSE {port}

ENV JAVA_OPTS="-Xmx512m -Xms256m"
ENV SERVER_PORT={port}

HEALTHCHECK --interval=30s --timeout=10s --start-period=60s --retries=3 \
  CMD wget --quiet --tries=1 --spider http://localhost:{port}/actuator/health || \
      wget --quiet --tries=1 --spider http://localhost:{port}/ || exit 1

ENTRYPOINT ["sh", "-c", "java $JAVA_OPTS -Dserver.port=$SERVER_PORT -jar app.jar"]
"#
        ),
        BuildTool::PrebuiltJar => format!(
            r#"FROM eclipse-temurin:17-jre-alpine
WORKDIR /app

COPY {entry_jar} app.jar

EXPOSE {port}

ENV JAVA_OPTS="-Xmx512m -Xms256m"
ENV SERVER_PORT={port}

HEALTHCHECK --interval=30s --timeout=10s --start-period=60s --retries=3 \
  CMD wget --quiet --tries=1 --spider http://localhost:{port}/ || exit 1

ENTRYPOINT ["sh", "-c", "java $JAVA_OPTS -Dserver.port=$SERVER_PORT -jar app.jar"]
"#
        ),
    };

    let mut env = std::collections::BTreeMap::from([
        ("SERVER_PORT".to_string(), port.to_string()),
        ("JAVA_OPTS".to_string(), "-Xmx512m -Xms256m".to_string()),
    ]);
    env.extend(config.env_map());

    let name = derive_name("java", deployment_id, version);

    Ok(Recipe {
        dockerfile,
        build_ignore: BUILD_IGNORE.to_string(),
        aux_files: Vec::new(),
        image_tag: name.clone(),
        container_name: name,
        container_port: port,
        env,
        labels: labels_for("web-service", Some(Runtime::Java), deployment_id),
        volume: volume_for(config, deployment_id),
        auto_restart: config.auto_restart,
        startup_grace: Duration::from_secs(60),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn maven_project_builds_in_two_stages() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "dep1", 1).unwrap();
        assert!(recipe.dockerfile.contains("FROM maven:3.9-eclipse-temurin-17 AS builder"));
        assert!(recipe.dockerfile.contains("mvn clean package -DskipTests -B"));
        assert!(recipe.dockerfile.contains("FROM eclipse-temurin:17-jre-alpine"));
        assert_eq!(recipe.container_port, 8080);
        assert_eq!(recipe.env.get("SERVER_PORT").unwrap(), "8080");
    }

    #[test]
    fn gradle_project_uses_boot_jar() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("build.gradle"), "").unwrap();

        let recipe = synthesize(dir.path(), &DeployConfig::default(), "dep1", 1).unwrap();
        assert!(recipe.dockerfile.contains("gradle bootJar --no-daemon -x test"));
    }

    #[test]
    fn bare_jar_is_wrapped_directly() {
        let dir = TempDir::new().unwrap();

        let config = DeployConfig {
            entry_file: Some("service.jar".to_string()),
            ..Default::default()
        };
        let recipe = synthesize(dir.path(), &config, "dep1", 1).unwrap();
        assert!(recipe.dockerfile.contains("COPY service.jar app.jar"));
        assert!(!recipe.dockerfile.contains("AS builder"));
    }
}
