//! Template, template-file and image persistence

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::template::{Template, TemplateFile, TemplateImage};
use crate::error::{Error, Result};

#[derive(Debug, FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    description: String,
    created_on: String,
    last_modified_on: String,
    is_built: bool,
}

impl TryFrom<TemplateRow> for Template {
    type Error = Error;

    fn try_from(row: TemplateRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| Error::Internal(format!("Failed to parse template id: {}", e)))?;

        let created_on = parse_timestamp(&row.created_on, "created_on")?;
        let last_modified_on = parse_timestamp(&row.last_modified_on, "last_modified_on")?;

        Ok(Template {
            id,
            name: row.name,
            description: row.description,
            created_on,
            last_modified_on,
            is_built: row.is_built,
            file_map: HashMap::new(),
        })
    }
}

fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

#[derive(Debug, FromRow)]
struct TemplateFileRow {
    template_id: String,
    file_path: String,
    content: Vec<u8>,
}

impl TryFrom<TemplateFileRow> for TemplateFile {
    type Error = Error;

    fn try_from(row: TemplateFileRow) -> Result<Self> {
        let template_id = Uuid::parse_str(&row.template_id)
            .map_err(|e| Error::Internal(format!("Failed to parse template id: {}", e)))?;

        Ok(TemplateFile {
            template_id,
            file_path: row.file_path,
            content: row.content,
        })
    }
}

/// Template repository for database operations
pub struct TemplateRepository {
    pool: SqlitePool,
}

impl TemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// List all templates, without files
    pub async fn list(&self) -> Result<Vec<Template>> {
        let rows: Vec<TemplateRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, created_on, last_modified_on, is_built
            FROM templates
            ORDER BY created_on
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Template::try_from).collect()
    }

    /// Find a template by name with its file index populated
    pub async fn find_by_name(&self, name: &str) -> Result<Template> {
        let row: TemplateRow = sqlx::query_as(
            r#"
            SELECT id, name, description, created_on, last_modified_on, is_built
            FROM templates
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::TemplateNotFound(name.to_string()))?;

        let mut template = Template::try_from(row)?;

        let file_rows: Vec<TemplateFileRow> = sqlx::query_as(
            r#"
            SELECT template_id, file_path, content
            FROM template_files
            WHERE template_id = ?
            "#,
        )
        .bind(template.id.to_string())
        .fetch_all(&self.pool)
        .await?;

        for row in file_rows {
            let file = TemplateFile::try_from(row)?;
            template.file_map.insert(file.file_path.clone(), file);
        }

        Ok(template)
    }

    /// Whether a template with this name exists
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM templates WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    fn not_found(name: &str) -> Error {
        Error::TemplateNotFound(name.to_string())
    }

    /// Id of the named template
    pub async fn find_id_by_name(&self, name: &str) -> Result<Uuid> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM templates WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        let (id,) = row.ok_or_else(|| Self::not_found(name))?;
        Uuid::parse_str(&id)
            .map_err(|e| Error::Internal(format!("Failed to parse template id: {}", e)))
    }

    /// Insert a template and its initial files
    pub async fn insert_with_files(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        template: &Template,
        files: &[TemplateFile],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO templates (id, name, description, created_on, last_modified_on, is_built)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(&template.description)
        .bind(template.created_on.to_rfc3339())
        .bind(template.last_modified_on.to_rfc3339())
        .bind(template.is_built)
        .execute(&mut **tx)
        .await?;

        for file in files {
            sqlx::query(
                r#"
                INSERT INTO template_files (template_id, file_path, content)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(file.template_id.to_string())
            .bind(&file.file_path)
            .bind(&file.content)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Update a template's description; returns rows changed
    pub async fn update_description(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        name: &str,
        description: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE templates
            SET description = ?, last_modified_on = ?
            WHERE name = ?
            "#,
        )
        .bind(description)
        .bind(Utc::now().to_rfc3339())
        .bind(name)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Replace a template file's content; returns rows changed
    pub async fn update_file_content(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        template_id: Uuid,
        file_path: &str,
        content: &[u8],
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE template_files
            SET content = ?
            WHERE template_id = ? AND file_path = ?
            "#,
        )
        .bind(content)
        .bind(template_id.to_string())
        .bind(file_path)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete a template by name; returns rows removed
    pub async fn delete_by_name(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        name: &str,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM templates WHERE name = ?")
            .bind(name)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }

    /// Fetch a single file, distinguishing template from file misses
    pub async fn find_file(&self, template_name: &str, file_path: &str) -> Result<TemplateFile> {
        let template_id = self.find_id_by_name(template_name).await?;

        let row: TemplateFileRow = sqlx::query_as(
            r#"
            SELECT template_id, file_path, content
            FROM template_files
            WHERE template_id = ? AND file_path = ?
            "#,
        )
        .bind(template_id.to_string())
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::TemplateFileNotFound(file_path.to_string()))?;

        row.try_into()
    }

    /// Record a built image and flip the template's built flag
    pub async fn insert_image(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        image: &TemplateImage,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO template_images (template_id, image_tag, image_id)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(image.template_id.to_string())
        .bind(&image.image_tag)
        .bind(&image.image_id)
        .execute(&mut **tx)
        .await?;

        sqlx::query("UPDATE templates SET is_built = 1 WHERE id = ?")
            .bind(image.template_id.to_string())
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// List all built images
    pub async fn list_images(&self) -> Result<Vec<TemplateImage>> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT template_id, image_tag, image_id FROM template_images")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(template_id, image_tag, image_id)| {
                let template_id = Uuid::parse_str(&template_id)
                    .map_err(|e| Error::Internal(format!("Failed to parse template id: {}", e)))?;
                Ok(TemplateImage {
                    template_id,
                    image_tag,
                    image_id,
                })
            })
            .collect()
    }

    /// Find an image by its engine-assigned id
    pub async fn find_image_by_id(&self, image_id: &str) -> Result<TemplateImage> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT template_id, image_tag, image_id
            FROM template_images
            WHERE image_id = ?
            "#,
        )
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        let (template_id, image_tag, image_id) =
            row.ok_or_else(|| Error::ImageNotFound(image_id.to_string()))?;

        let template_id = Uuid::parse_str(&template_id)
            .map_err(|e| Error::Internal(format!("Failed to parse template id: {}", e)))?;

        Ok(TemplateImage {
            template_id,
            image_tag,
            image_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite::test_pool;

    fn sample_template(name: &str) -> (Template, Vec<TemplateFile>) {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let template = Template {
            id,
            name: name.to_string(),
            description: "a template".to_string(),
            created_on: now,
            last_modified_on: now,
            is_built: false,
            file_map: HashMap::new(),
        };
        let files = vec![
            TemplateFile {
                template_id: id,
                file_path: "Dockerfile".to_string(),
                content: b"FROM fedora:40\n".to_vec(),
            },
            TemplateFile {
                template_id: id,
                file_path: "README.md".to_string(),
                content: Vec::new(),
            },
        ];
        (template, files)
    }

    async fn insert_committed(
        repo: &TemplateRepository,
        pool: &SqlitePool,
        template: &Template,
        files: &[TemplateFile],
    ) {
        let mut tx = pool.begin().await.expect("Failed to begin tx");
        repo.insert_with_files(&mut tx, template, files)
            .await
            .expect("Failed to insert");
        tx.commit().await.expect("Failed to commit");
    }

    #[tokio::test]
    async fn insert_and_find_with_files() {
        let pool = test_pool().await;
        let repo = TemplateRepository::new(pool.clone());

        let (template, files) = sample_template("dev");
        insert_committed(&repo, &pool, &template, &files).await;

        let found = repo.find_by_name("dev").await.expect("Failed to find");
        assert_eq!(found.id, template.id);
        assert!(!found.is_built);
        assert_eq!(found.file_map.len(), 2);
        assert_eq!(
            found.file_map["Dockerfile"].content,
            b"FROM fedora:40\n".to_vec()
        );
    }

    #[tokio::test]
    async fn missing_template_is_not_found() {
        let pool = test_pool().await;
        let repo = TemplateRepository::new(pool);

        assert!(matches!(
            repo.find_by_name("ghost").await,
            Err(Error::TemplateNotFound(_))
        ));
        assert!(matches!(
            repo.find_id_by_name("ghost").await,
            Err(Error::TemplateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_description_reports_row_count() {
        let pool = test_pool().await;
        let repo = TemplateRepository::new(pool.clone());

        let (template, files) = sample_template("dev");
        insert_committed(&repo, &pool, &template, &files).await;

        let mut tx = pool.begin().await.expect("Failed to begin tx");
        let changed = repo
            .update_description(&mut tx, "dev", "updated")
            .await
            .expect("Failed to update");
        assert_eq!(changed, 1);

        let changed = repo
            .update_description(&mut tx, "ghost", "updated")
            .await
            .expect("Update should run");
        assert_eq!(changed, 0);
        tx.commit().await.expect("Failed to commit");

        let found = repo.find_by_name("dev").await.expect("Failed to find");
        assert_eq!(found.description, "updated");
    }

    #[tokio::test]
    async fn file_misses_are_distinguished() {
        let pool = test_pool().await;
        let repo = TemplateRepository::new(pool.clone());

        let (template, files) = sample_template("dev");
        insert_committed(&repo, &pool, &template, &files).await;

        assert!(matches!(
            repo.find_file("ghost", "Dockerfile").await,
            Err(Error::TemplateNotFound(_))
        ));
        assert!(matches!(
            repo.find_file("dev", "missing.txt").await,
            Err(Error::TemplateFileNotFound(_))
        ));

        let file = repo
            .find_file("dev", "Dockerfile")
            .await
            .expect("Failed to fetch file");
        assert_eq!(file.content, b"FROM fedora:40\n".to_vec());
    }

    #[tokio::test]
    async fn update_file_content_round_trips() {
        let pool = test_pool().await;
        let repo = TemplateRepository::new(pool.clone());

        let (template, files) = sample_template("dev");
        insert_committed(&repo, &pool, &template, &files).await;

        let mut tx = pool.begin().await.expect("Failed to begin tx");
        let changed = repo
            .update_file_content(&mut tx, template.id, "Dockerfile", b"FROM fedora:41\n")
            .await
            .expect("Failed to update file");
        assert_eq!(changed, 1);
        tx.commit().await.expect("Failed to commit");

        let file = repo
            .find_file("dev", "Dockerfile")
            .await
            .expect("Failed to fetch file");
        assert_eq!(file.content, b"FROM fedora:41\n".to_vec());
    }

    #[tokio::test]
    async fn delete_cascades_to_files() {
        let pool = test_pool().await;
        let repo = TemplateRepository::new(pool.clone());

        let (template, files) = sample_template("dev");
        insert_committed(&repo, &pool, &template, &files).await;

        let mut tx = pool.begin().await.expect("Failed to begin tx");
        let deleted = repo
            .delete_by_name(&mut tx, "dev")
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, 1);
        tx.commit().await.expect("Failed to commit");

        assert!(matches!(
            repo.find_file("dev", "Dockerfile").await,
            Err(Error::TemplateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn image_insert_marks_template_built() {
        let pool = test_pool().await;
        let repo = TemplateRepository::new(pool.clone());

        let (template, files) = sample_template("dev");
        insert_committed(&repo, &pool, &template, &files).await;

        let image = TemplateImage {
            template_id: template.id,
            image_tag: "dev:1".to_string(),
            image_id: "sha256:abc123".to_string(),
        };

        let mut tx = pool.begin().await.expect("Failed to begin tx");
        repo.insert_image(&mut tx, &image)
            .await
            .expect("Failed to insert image");
        tx.commit().await.expect("Failed to commit");

        let found = repo.find_by_name("dev").await.expect("Failed to find");
        assert!(found.is_built);

        let by_id = repo
            .find_image_by_id("sha256:abc123")
            .await
            .expect("Failed to find image");
        assert_eq!(by_id.image_tag, "dev:1");

        assert!(matches!(
            repo.find_image_by_id("sha256:nope").await,
            Err(Error::ImageNotFound(_))
        ));
    }
}
