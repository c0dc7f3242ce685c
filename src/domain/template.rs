//! Template domain model

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

/// A named, buildable Dockerfile bundle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(skip)]
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_on: DateTime<Utc>,
    pub last_modified_on: DateTime<Utc>,
    pub is_built: bool,

    /// File index keyed by path, populated by eager loads
    #[serde(rename = "files", skip_serializing_if = "HashMap::is_empty")]
    pub file_map: HashMap<String, TemplateFile>,
}

/// One file inside a template
#[derive(Debug, Clone, Serialize)]
pub struct TemplateFile {
    #[serde(skip)]
    pub template_id: Uuid,

    #[serde(rename = "path")]
    pub file_path: String,

    #[serde(serialize_with = "as_base64")]
    pub content: Vec<u8>,
}

fn as_base64<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(content))
}

/// An engine image produced by building a template
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateImage {
    #[serde(skip)]
    pub template_id: Uuid,
    pub image_tag: String,
    pub image_id: String,
}

/// A seed Dockerfile compiled into the binary
#[derive(Debug, Clone, Serialize)]
pub struct BaseTemplate {
    pub name: &'static str,
    pub id: &'static str,
    #[serde(skip)]
    pub content: &'static str,
}

const FEDORA_40_OPENSSH: BaseTemplate = BaseTemplate {
    name: "Fedora 40 With OpenSSH Server",
    id: "fedora-40-openssh",
    content: r#"FROM fedora:40

ARG user
ARG password

RUN dnf install -y openssh-server \
    && mkdir -p /etc/ssh \
    && ssh-keygen -q -N "" -t rsa -b 4096 -f /etc/ssh/ssh_host_rsa_key \
    && useradd "$user" \
    && echo "$user:$password" | chpasswd \
    && usermod -aG wheel "$user"

CMD ["/usr/sbin/sshd", "-D"]
"#,
};

const FEDORA_40_OPENSSH_DOCKER: BaseTemplate = BaseTemplate {
    name: "Fedora 40 + OpenSSH Server + Docker",
    id: "fedora-40-openssh-docker",
    content: r#"FROM fedora:40

ARG user
ARG password

RUN dnf install -y openssh-server dnf-plugins-core \
    && dnf-3 config-manager --add-repo https://download.docker.com/linux/fedora/docker-ce.repo \
    && dnf install -y docker-ce docker-ce-cli containerd.io docker-buildx-plugin docker-compose-plugin \
    && mkdir -p /etc/ssh \
    && ssh-keygen -q -N "" -t rsa -b 4096 -f /etc/ssh/ssh_host_rsa_key \
    && useradd "$user" \
    && echo "$user:$password" | chpasswd \
    && usermod -aG wheel,docker "$user"

CMD ["/usr/sbin/sshd", "-D"]
"#,
};

const EMPTY: BaseTemplate = BaseTemplate {
    name: "Empty",
    id: "empty",
    content: "",
};

/// Base templates offered in the UI catalog
pub fn base_templates() -> &'static [BaseTemplate] {
    const CATALOG: [BaseTemplate; 2] = [FEDORA_40_OPENSSH, FEDORA_40_OPENSSH_DOCKER];
    &CATALOG
}

/// Look up a base template by id. `empty` is addressable but not listed.
pub fn find_base_template(id: &str) -> Option<BaseTemplate> {
    match id {
        "empty" => Some(EMPTY),
        "fedora-40-openssh" => Some(FEDORA_40_OPENSSH),
        "fedora-40-openssh-docker" => Some(FEDORA_40_OPENSSH_DOCKER),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_fedora_templates_only() {
        let catalog = base_templates();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.iter().all(|t| t.id.starts_with("fedora-40")));
    }

    #[test]
    fn empty_is_addressable_but_unlisted() {
        let empty = find_base_template("empty").expect("empty should resolve");
        assert_eq!(empty.content, "");
        assert!(base_templates().iter().all(|t| t.id != "empty"));
    }

    #[test]
    fn unknown_base_template_is_none() {
        assert!(find_base_template("ubuntu-22").is_none());
    }

    #[test]
    fn fedora_template_starts_with_from_line() {
        let t = find_base_template("fedora-40-openssh").expect("should resolve");
        assert!(t.content.starts_with("FROM fedora:40"));
    }

    #[test]
    fn template_file_content_serializes_as_base64() {
        let file = TemplateFile {
            template_id: Uuid::now_v7(),
            file_path: "Dockerfile".into(),
            content: b"FROM fedora:40\n".to_vec(),
        };

        let json = serde_json::to_value(&file).expect("Failed to serialize");
        assert_eq!(json["path"], "Dockerfile");
        assert_eq!(json["content"], BASE64.encode(b"FROM fedora:40\n"));
    }

    #[test]
    fn template_omits_empty_file_map() {
        let t = Template {
            id: Uuid::now_v7(),
            name: "dev".into(),
            description: String::new(),
            created_on: Utc::now(),
            last_modified_on: Utc::now(),
            is_built: false,
            file_map: HashMap::new(),
        };

        let json = serde_json::to_value(&t).expect("Failed to serialize");
        assert_eq!(json["isBuilt"], false);
        assert!(json.get("files").is_none());
        assert!(json.get("id").is_none());
    }
}
