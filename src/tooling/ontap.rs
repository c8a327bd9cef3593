use std::{fmt::Write as _, sync::LazyLock, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{config::Storage, error::KairosError, records::StorageSystemRecord};

const ZAPI_PATH: &str = "/servlets/netapp.servlets.admin.XMLrequest_filer";
const ZAPI_NS: &str = "http://www.netapp.com/filer/admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Iscsi,
    Fcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Iscsi => "iscsi",
            Protocol::Fcp => "fcp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub busy: bool,
}

/// Storage controller operations. A `failed` API status surfaces as `KairosError::RemoteCommand`.
pub trait StoragePort: Send + Sync {
    fn svm(&self) -> &str;
    fn ping(&self) -> Result<String>;
    fn create_consistency_group(&self, volumes: &[String], snapshot: &str, timeout: &str) -> Result<()>;
    /// `None` when the snapshot does not exist on the volume.
    fn snapshot_info(&self, volume: &str, snapshot: &str) -> Result<Option<SnapshotInfo>>;
    fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<()>;
    fn restore_snapshot(&self, volume: &str, snapshot: &str) -> Result<()>;
    fn create_flexclone(&self, volume: &str, parent_volume: &str, parent_snapshot: &str) -> Result<()>;
    fn destroy_volume(&self, volume: &str) -> Result<()>;
    fn create_igroup(&self, name: &str, protocol: Protocol) -> Result<()>;
    fn add_initiators(&self, igroup: &str, initiators: &[String]) -> Result<()>;
    fn destroy_igroup(&self, name: &str) -> Result<()>;
    fn map_lun(&self, path: &str, igroup: &str) -> Result<()>;
    fn unmap_lun(&self, path: &str, igroup: &str) -> Result<()>;
}

/// ZAPI request element.
#[derive(Debug, Clone)]
enum Node {
    Text(&'static str, String),
    Elem(&'static str, Vec<Node>),
}

impl Node {
    fn text(name: &'static str, v: impl Into<String>) -> Self {
        Node::Text(name, v.into())
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Node::Text(n, v) => {
                let _ = write!(out, "<{n}>{}</{n}>", xml_escape(v));
            }
            Node::Elem(n, children) => {
                let _ = write!(out, "<{n}>");
                for c in children {
                    c.write_to(out);
                }
                let _ = write!(out, "</{n}>");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiOutcome {
    pub passed: bool,
    pub detail: String,
    body: String,
}

impl ApiOutcome {
    fn value(&self, tag: &str) -> Option<String> {
        tag_text(&self.body, tag)
    }
}

pub struct OntapZapi {
    client: reqwest::blocking::Client,
    url: String,
    username: String,
    password: String,
    svm: String,
    api_version: String,
}

impl OntapZapi {
    pub fn new(cfg: &Storage, sys: &StorageSystemRecord) -> Result<Self> {
        let scheme = if cfg.https { "https" } else { "http" };
        let client = reqwest::blocking::ClientBuilder::new()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()
            .context("build storage http client")?;
        Ok(Self {
            client,
            url: format!("{scheme}://{}:{}{ZAPI_PATH}", sys.netapp_ip, cfg.port),
            username: sys.username.clone(),
            password: sys.password.clone(),
            svm: sys.svm_name.clone(),
            api_version: cfg.api_version.clone(),
        })
    }

    fn envelope(&self, api: &str, args: &[Node]) -> String {
        let mut body = String::new();
        for a in args {
            a.write_to(&mut body);
        }
        let vfiler = if self.svm.is_empty() {
            String::new()
        } else {
            format!(" vfiler=\"{}\"", xml_escape(&self.svm))
        };
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <netapp version=\"{}\" xmlns=\"{ZAPI_NS}\"{vfiler}><{api}>{body}</{api}></netapp>",
            self.api_version
        )
    }

    fn invoke(&self, api: &str, args: &[Node]) -> Result<ApiOutcome> {
        tracing::debug!("zapi {} -> {api}", self.svm);
        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(self.envelope(api, args))
            .send()
            .with_context(|| format!("POST {api} to {}", self.url))?;
        let status = resp.status();
        let text = resp
            .text()
            .with_context(|| format!("read {api} response"))?;
        if !status.is_success() {
            bail!("{api}: HTTP {status} from {}", self.url);
        }
        parse_results(&text).with_context(|| format!("parse {api} response"))
    }

    /// Runs `api`; a `failed` status is an error naming the SVM and the call.
    fn call(&self, api: &str, args: &[Node]) -> Result<ApiOutcome> {
        let out = self.invoke(api, args)?;
        if !out.passed {
            return Err(KairosError::remote(
                format!("{}/{api}", self.svm),
                out.detail.clone(),
            )
            .into());
        }
        Ok(out)
    }
}

impl StoragePort for OntapZapi {
    fn svm(&self) -> &str {
        &self.svm
    }

    fn ping(&self) -> Result<String> {
        let out = self.call("system-get-version", &[])?;
        Ok(out.value("version").unwrap_or_default())
    }

    fn create_consistency_group(&self, volumes: &[String], snapshot: &str, timeout: &str) -> Result<()> {
        let vols = volumes
            .iter()
            .map(|v| Node::text("volume-name", v.clone()))
            .collect();
        let started = self.call(
            "cg-start",
            &[
                Node::text("snapshot", snapshot),
                Node::text("timeout", timeout),
                Node::Elem("volumes", vols),
            ],
        )?;
        let Some(cg_id) = started.value("cg-id") else {
            bail!("{}: cg-start returned no cg-id", self.svm);
        };
        self.call("cg-commit", &[Node::text("cg-id", cg_id)])?;
        Ok(())
    }

    fn snapshot_info(&self, volume: &str, snapshot: &str) -> Result<Option<SnapshotInfo>> {
        let out = self.call(
            "snapshot-get-iter",
            &[
                Node::Elem(
                    "query",
                    vec![Node::Elem(
                        "snapshot-info",
                        vec![Node::text("volume", volume), Node::text("name", snapshot)],
                    )],
                ),
                Node::Elem(
                    "desired-attributes",
                    vec![Node::Elem("snapshot-info", vec![Node::text("busy", "")])],
                ),
            ],
        )?;
        let n: u64 = out
            .value("num-records")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if n == 0 {
            return Ok(None);
        }
        let busy = out.value("busy").is_some_and(|b| b == "true");
        Ok(Some(SnapshotInfo { busy }))
    }

    fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<()> {
        self.call(
            "snapshot-delete",
            &[Node::text("volume", volume), Node::text("snapshot", snapshot)],
        )
        .map(|_| ())
    }

    fn restore_snapshot(&self, volume: &str, snapshot: &str) -> Result<()> {
        self.call(
            "snapshot-restore-volume",
            &[
                Node::text("volume", volume),
                Node::text("snapshot", snapshot),
                Node::text("preserve-lun-ids", "true"),
            ],
        )
        .map(|_| ())
    }

    fn create_flexclone(&self, volume: &str, parent_volume: &str, parent_snapshot: &str) -> Result<()> {
        self.call(
            "volume-clone-create",
            &[
                Node::text("volume", volume),
                Node::text("parent-volume", parent_volume),
                Node::text("parent-snapshot", parent_snapshot),
            ],
        )
        .map(|_| ())
    }

    fn destroy_volume(&self, volume: &str) -> Result<()> {
        self.call("volume-offline", &[Node::text("name", volume)])?;
        self.call("volume-destroy", &[Node::text("name", volume)])?;
        Ok(())
    }

    fn create_igroup(&self, name: &str, protocol: Protocol) -> Result<()> {
        self.call(
            "igroup-create",
            &[
                Node::text("initiator-group-name", name),
                Node::text("initiator-group-type", protocol.as_str()),
                Node::text("os-type", "linux"),
            ],
        )
        .map(|_| ())
    }

    fn add_initiators(&self, igroup: &str, initiators: &[String]) -> Result<()> {
        for i in initiators {
            self.call(
                "igroup-add",
                &[
                    Node::text("initiator-group-name", igroup),
                    Node::text("initiator", i.clone()),
                ],
            )?;
        }
        Ok(())
    }

    fn destroy_igroup(&self, name: &str) -> Result<()> {
        self.call(
            "igroup-destroy",
            &[Node::text("initiator-group-name", name)],
        )
        .map(|_| ())
    }

    fn map_lun(&self, path: &str, igroup: &str) -> Result<()> {
        self.call(
            "lun-map",
            &[Node::text("path", path), Node::text("initiator-group", igroup)],
        )
        .map(|_| ())
    }

    fn unmap_lun(&self, path: &str, igroup: &str) -> Result<()> {
        self.call(
            "lun-unmap",
            &[Node::text("path", path), Node::text("initiator-group", igroup)],
        )
        .map(|_| ())
    }
}

// Built without unicode-perl, so whitespace is spelled out.
static RESULTS_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r#"<results[ \t\r\n]([^>]*?)/?>"#));
static ATTR_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_-]+)[ \t\r\n]*=[ \t\r\n]*"([^"]*)""#));

fn compiled(re: &'static LazyLock<Result<Regex, regex::Error>>) -> Result<&'static Regex> {
    LazyLock::force(re)
        .as_ref()
        .map_err(|e| anyhow!("zapi response pattern: {e}"))
}

fn parse_results(body: &str) -> Result<ApiOutcome> {
    let results_re = compiled(&RESULTS_RE)?;
    let attr_re = compiled(&ATTR_RE)?;
    let Some(caps) = results_re.captures(body) else {
        bail!("no <results> element in response");
    };
    let mut status = None;
    let mut reason = None;
    let mut errno = None;
    for a in attr_re.captures_iter(&caps[1]) {
        match &a[1] {
            "status" => status = Some(a[2].to_string()),
            "reason" => reason = Some(xml_unescape(&a[2])),
            "errno" => errno = Some(a[2].to_string()),
            _ => {}
        }
    }
    let passed = match status.as_deref() {
        Some("passed") => true,
        Some("failed") => false,
        other => bail!("unexpected results status {other:?}"),
    };
    let detail = match (reason, errno) {
        (Some(r), Some(e)) => format!("{r} (errno {e})"),
        (Some(r), None) => r,
        (None, _) if passed => "passed".to_string(),
        (None, Some(e)) => format!("failed (errno {e})"),
        (None, None) => "failed".to_string(),
    };
    Ok(ApiOutcome {
        passed,
        detail,
        body: body.to_string(),
    })
}

/// Text of the first `<tag>..</tag>` in `body`.
fn tag_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(xml_unescape(body[start..end].trim()))
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
