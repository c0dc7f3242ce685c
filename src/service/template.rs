//! Template service: CRUD over templates and the streaming build pipeline

use std::collections::HashMap;
use std::sync::Arc;

use bollard::models::{BuildInfo, BuildInfoAux};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::template::{
    base_templates, find_base_template, BaseTemplate, Template, TemplateFile, TemplateImage,
};
use crate::infra::docker::{self, DockerManager};
use crate::infra::template_repository::TemplateRepository;
use crate::error::{Error, Result};

/// One event on a build's output channel
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// A log line, forwarded to the client as-is
    Log(String),
    /// A failure; terminates the stream
    Error(String),
    /// The recorded image, emitted last on success
    Image(TemplateImage),
}

/// Template service for managing templates and builds
pub struct TemplateService {
    repository: Arc<TemplateRepository>,
    docker: Arc<DockerManager>,
    pool: SqlitePool,
}

impl TemplateService {
    pub fn new(
        repository: Arc<TemplateRepository>,
        docker: Arc<DockerManager>,
        pool: SqlitePool,
    ) -> Self {
        Self {
            repository,
            docker,
            pool,
        }
    }

    /// The static base template catalog
    pub fn base_templates(&self) -> &'static [BaseTemplate] {
        base_templates()
    }

    /// Create a template seeded from a base template
    pub async fn create(
        &self,
        name: &str,
        base_template: &str,
        description: &str,
    ) -> Result<Template> {
        let base = find_base_template(base_template)
            .ok_or_else(|| Error::BaseTemplateNotFound(base_template.to_string()))?;

        let id = Uuid::now_v7();
        let now = Utc::now();

        let mut template = Template {
            id,
            name: name.to_string(),
            description: description.to_string(),
            created_on: now,
            last_modified_on: now,
            is_built: false,
            file_map: HashMap::new(),
        };

        let files = vec![
            TemplateFile {
                template_id: id,
                file_path: "Dockerfile".to_string(),
                content: base.content.as_bytes().to_vec(),
            },
            TemplateFile {
                template_id: id,
                file_path: "README.md".to_string(),
                content: Vec::new(),
            },
        ];

        let mut tx = self.pool.begin().await?;
        self.repository
            .insert_with_files(&mut tx, &template, &files)
            .await?;
        tx.commit().await?;

        for file in files {
            template.file_map.insert(file.file_path.clone(), file);
        }

        info!("Template {} created from base {}", name, base_template);
        Ok(template)
    }

    pub async fn find_all(&self) -> Result<Vec<Template>> {
        self.repository.list().await
    }

    pub async fn find(&self, name: &str) -> Result<Template> {
        self.repository.find_by_name(name).await
    }

    pub async fn has(&self, name: &str) -> Result<bool> {
        self.repository.exists(name).await
    }

    /// Update a template's description
    pub async fn update_description(&self, name: &str, description: &str) -> Result<Template> {
        let mut tx = self.pool.begin().await?;
        let changed = self
            .repository
            .update_description(&mut tx, name, description)
            .await?;

        if changed == 0 {
            return Err(Error::TemplateNotFound(name.to_string()));
        }
        tx.commit().await?;

        self.repository.find_by_name(name).await
    }

    /// Replace a template file's content
    pub async fn update_file(&self, name: &str, file_path: &str, content: &[u8]) -> Result<()> {
        let template_id = self.repository.find_id_by_name(name).await?;

        let mut tx = self.pool.begin().await?;
        let changed = self
            .repository
            .update_file_content(&mut tx, template_id, file_path, content)
            .await?;

        if changed == 0 {
            return Err(Error::TemplateFileNotFound(file_path.to_string()));
        }
        tx.commit().await?;

        Ok(())
    }

    /// Fetch one file from a template
    pub async fn find_file(&self, name: &str, file_path: &str) -> Result<TemplateFile> {
        self.repository.find_file(name, file_path).await
    }

    /// Delete a template by name
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deleted = self.repository.delete_by_name(&mut tx, name).await?;

        if deleted == 0 {
            return Err(Error::TemplateNotFound(name.to_string()));
        }
        if deleted != 1 {
            return Err(Error::TransactionAborted(format!(
                "unexpected number of templates deleted: {}",
                deleted
            )));
        }
        tx.commit().await?;

        info!("Template {} deleted", name);
        Ok(())
    }

    pub async fn images(&self) -> Result<Vec<TemplateImage>> {
        self.repository.list_images().await
    }

    /// Build a template's Dockerfile into an image.
    ///
    /// Returns a channel of build events; the channel closes when the build
    /// finishes, one way or the other. The backing transaction stays open
    /// for the duration of the engine stream so the image row is only ever
    /// committed together with a finished build.
    pub async fn build(
        &self,
        template: &Template,
        image_tag: &str,
        build_args: HashMap<String, String>,
    ) -> Result<mpsc::UnboundedReceiver<BuildEvent>> {
        let dockerfile = template
            .file_map
            .get("Dockerfile")
            .filter(|f| !f.content.is_empty())
            .ok_or_else(|| {
                Error::BadTemplate("template does not contain a Dockerfile".to_string())
            })?;

        let tar = dockerfile_tar(&dockerfile.content)?;

        let mut tx = self.pool.begin().await?;

        let (events, receiver) = mpsc::unbounded_channel();
        let docker = self.docker.clone();
        let repository = self.repository.clone();
        let template_id = template.id;
        let image_tag = image_tag.to_string();

        tokio::spawn(async move {
            let mut stream = docker.build_image(tar, &image_tag, build_args);
            let mut image_id: Option<String> = None;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(progress) => match translate_progress(progress) {
                        Progress::Emit(text) => {
                            if events.send(BuildEvent::Log(text)).is_err() {
                                // Consumer is gone; abandon the build and
                                // roll back.
                                return;
                            }
                        }
                        Progress::EmitError(text) => {
                            let _ = events.send(BuildEvent::Error(text));
                            return;
                        }
                        Progress::ImageId(id) => {
                            debug!("Build produced image {}", id);
                            image_id = Some(id);
                        }
                        Progress::Nothing => {}
                    },
                    Err(e) => {
                        let message = if docker::is_invalid_parameter(&e) {
                            Error::BadTemplate(docker::daemon_message(&e)).to_string()
                        } else {
                            e.to_string()
                        };
                        error!("Build failed: {}", message);
                        let _ = events.send(BuildEvent::Error(format!("{}\n", message)));
                        return;
                    }
                }
            }

            match image_id {
                Some(id) => {
                    let image = TemplateImage {
                        template_id,
                        image_tag,
                        image_id: id,
                    };

                    if let Err(e) = repository.insert_image(&mut tx, &image).await {
                        let _ = events.send(BuildEvent::Error(format!("{}\n", e)));
                        return;
                    }
                    if let Err(e) = tx.commit().await {
                        let _ = events.send(BuildEvent::Error(format!("{}\n", e)));
                        return;
                    }

                    info!("Image {} recorded as {}", image.image_id, image.image_tag);
                    let _ = events.send(BuildEvent::Image(image));
                }
                None => {
                    // Stream ended without an image id: nothing to record.
                    let _ = tx.commit().await;
                }
            }
        });

        Ok(receiver)
    }
}

/// Assemble a single-entry tar archive holding the Dockerfile
fn dockerfile_tar(dockerfile: &[u8]) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header
        .set_path("Dockerfile")
        .map_err(|e| Error::Internal(e.to_string()))?;
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    builder
        .append(&header, dockerfile)
        .map_err(|e| Error::Internal(e.to_string()))?;

    let bytes = builder
        .into_inner()
        .map_err(|e| Error::Internal(e.to_string()))?;

    Ok(Bytes::from(bytes))
}

enum Progress {
    Emit(String),
    EmitError(String),
    ImageId(String),
    Nothing,
}

/// Translate one engine progress message into its stream emission
fn translate_progress(info: BuildInfo) -> Progress {
    if let Some(stream) = info.stream {
        return Progress::Emit(stream);
    }

    if let Some(error) = info.error {
        return Progress::EmitError(format!("{}\n", error));
    }

    if let Some(status) = info.status {
        let text = match info.progress {
            Some(progress) => format!("{}: {}\n", status, progress),
            None => format!("{}\n", status),
        };
        return Progress::Emit(text);
    }

    if let Some(BuildInfoAux::Default(image)) = info.aux {
        if let Some(id) = image.id {
            return Progress::ImageId(id);
        }
    }

    Progress::Nothing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite::test_pool;

    async fn service() -> TemplateService {
        let pool = test_pool().await;
        let repository = Arc::new(TemplateRepository::new(pool.clone()));
        let docker = Arc::new(DockerManager::new(None).expect("Failed to create docker client"));
        TemplateService::new(repository, docker, pool)
    }

    #[tokio::test]
    async fn create_seeds_dockerfile_from_base() {
        let svc = service().await;

        let template = svc
            .create("demo", "fedora-40-openssh", "d")
            .await
            .expect("Failed to create template");

        assert!(!template.is_built);
        assert_eq!(template.file_map.len(), 2);
        let dockerfile = &template.file_map["Dockerfile"];
        assert!(dockerfile.content.starts_with(b"FROM fedora:40"));
        assert!(template.file_map["README.md"].content.is_empty());

        let reloaded = svc.find("demo").await.expect("Failed to reload");
        assert!(reloaded.file_map["Dockerfile"]
            .content
            .starts_with(b"FROM fedora:40"));
    }

    #[tokio::test]
    async fn create_with_unknown_base_fails() {
        let svc = service().await;

        let result = svc.create("demo", "ubuntu-22", "d").await;
        assert!(matches!(result, Err(Error::BaseTemplateNotFound(_))));
        assert!(!svc.has("demo").await.expect("Failed to check"));
    }

    #[tokio::test]
    async fn update_description_of_missing_template_fails() {
        let svc = service().await;

        let result = svc.update_description("ghost", "d").await;
        assert!(matches!(result, Err(Error::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn update_file_distinguishes_misses() {
        let svc = service().await;
        svc.create("demo", "empty", "")
            .await
            .expect("Failed to create template");

        assert!(matches!(
            svc.update_file("ghost", "Dockerfile", b"FROM x").await,
            Err(Error::TemplateNotFound(_))
        ));
        assert!(matches!(
            svc.update_file("demo", "missing.txt", b"x").await,
            Err(Error::TemplateFileNotFound(_))
        ));

        svc.update_file("demo", "Dockerfile", b"FROM fedora:40\n")
            .await
            .expect("Failed to update file");
        let file = svc
            .find_file("demo", "Dockerfile")
            .await
            .expect("Failed to fetch file");
        assert_eq!(file.content, b"FROM fedora:40\n".to_vec());
    }

    #[tokio::test]
    async fn delete_missing_template_fails() {
        let svc = service().await;

        let result = svc.delete("ghost").await;
        assert!(matches!(result, Err(Error::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn build_without_dockerfile_fails_early() {
        let svc = service().await;
        let template = svc
            .create("demo", "empty", "")
            .await
            .expect("Failed to create template");

        let result = svc.build(&template, "demo:1", HashMap::new()).await;
        assert!(matches!(result, Err(Error::BadTemplate(_))));
    }

    #[test]
    fn dockerfile_tar_contains_one_entry() {
        let tar = dockerfile_tar(b"FROM fedora:40\n").expect("Failed to build tar");

        let mut archive = tar::Archive::new(tar.as_ref());
        let entries: Vec<_> = archive
            .entries()
            .expect("Failed to read archive")
            .collect::<std::io::Result<Vec<_>>>()
            .expect("Failed to read entries");

        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].path().expect("no path").to_string_lossy(),
            "Dockerfile"
        );
        assert_eq!(entries[0].size(), 15);
    }

    #[test]
    fn progress_stream_lines_are_forwarded_verbatim() {
        let info = BuildInfo {
            stream: Some("Step 1/3 : FROM fedora:40\n".to_string()),
            ..Default::default()
        };

        match translate_progress(info) {
            Progress::Emit(text) => assert_eq!(text, "Step 1/3 : FROM fedora:40\n"),
            _ => panic!("expected an emission"),
        }
    }

    #[test]
    fn progress_errors_gain_a_newline() {
        let info = BuildInfo {
            error: Some("something broke".to_string()),
            ..Default::default()
        };

        match translate_progress(info) {
            Progress::EmitError(text) => assert_eq!(text, "something broke\n"),
            _ => panic!("expected an error emission"),
        }
    }

    #[test]
    fn progress_status_renders_with_optional_progress() {
        let with_progress = BuildInfo {
            status: Some("Downloading".to_string()),
            progress: Some("[=====>    ] 12MB/24MB".to_string()),
            ..Default::default()
        };
        match translate_progress(with_progress) {
            Progress::Emit(text) => assert_eq!(text, "Downloading: [=====>    ] 12MB/24MB\n"),
            _ => panic!("expected an emission"),
        }

        let without_progress = BuildInfo {
            status: Some("Pulling fs layer".to_string()),
            ..Default::default()
        };
        match translate_progress(without_progress) {
            Progress::Emit(text) => assert_eq!(text, "Pulling fs layer\n"),
            _ => panic!("expected an emission"),
        }
    }

    #[test]
    fn progress_aux_captures_the_image_id() {
        let info = BuildInfo {
            aux: Some(BuildInfoAux::Default(bollard::models::ImageId {
                id: Some("sha256:abc123".to_string()),
            })),
            ..Default::default()
        };

        match translate_progress(info) {
            Progress::ImageId(id) => assert_eq!(id, "sha256:abc123"),
            _ => panic!("expected an image id"),
        }
    }

    #[test]
    fn empty_progress_emits_nothing() {
        assert!(matches!(
            translate_progress(BuildInfo::default()),
            Progress::Nothing
        ));
    }
}
