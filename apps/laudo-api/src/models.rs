//! Data models for the laudo API
//!
//! JSON keys keep the names used by existing clients (`controle`, `dados`,
//! `descricao`, ...); Rust names are English.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use laudo_core::{lenient, ReportData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Report row as stored in `avaliacoes`
#[derive(Debug, Clone, FromRow)]
pub struct DbReport {
    pub id: i64,
    pub controle: String,
    pub ano: i64,
    pub dados_json: String,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

/// A measured compartment of the appraised property
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Area {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub avaliacao_id: Option<i64>,
    #[sqlx(rename = "descricao")]
    #[serde(rename = "descricao", default, deserialize_with = "lenient::optional_text")]
    pub description: Option<String>,
    #[sqlx(rename = "largura")]
    #[serde(rename = "largura", default, deserialize_with = "lenient::number")]
    pub width: Option<f64>,
    #[sqlx(rename = "comprimento")]
    #[serde(rename = "comprimento", default, deserialize_with = "lenient::number")]
    pub length: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub area: Option<f64>,
    #[sqlx(rename = "tipo")]
    #[serde(rename = "tipo", default, deserialize_with = "lenient::optional_text")]
    pub category: Option<String>,
}

impl Area {
    /// Fill in `area` from width × length when the client left it blank
    pub fn with_computed_area(mut self) -> Self {
        if self.area.is_none() {
            if let (Some(width), Some(length)) = (self.width, self.length) {
                self.area = Some(width * length);
            }
        }
        self
    }
}

/// A market reference listing used for valuation by comparison
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Comparable {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub avaliacao_id: Option<i64>,
    #[sqlx(rename = "endereco")]
    #[serde(rename = "endereco", default, deserialize_with = "lenient::optional_text")]
    pub address: Option<String>,
    #[sqlx(rename = "valor")]
    #[serde(rename = "valor", default, deserialize_with = "lenient::number")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub area: Option<f64>,
    #[serde(default, deserialize_with = "lenient::optional_text")]
    pub link: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub longitude: Option<f64>,
    #[sqlx(rename = "observacoes")]
    #[serde(rename = "observacoes", default, deserialize_with = "lenient::optional_text")]
    pub notes: Option<String>,
}

/// An uploaded photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Photo {
    pub id: i64,
    pub avaliacao_id: i64,
    #[sqlx(rename = "legenda")]
    #[serde(rename = "legenda")]
    pub caption: Option<String>,
    /// Relative to the data directory, `/`-separated
    #[sqlx(rename = "caminho")]
    #[serde(rename = "caminho")]
    pub path: String,
    #[sqlx(rename = "ordem")]
    #[serde(rename = "ordem")]
    pub order: i64,
}

/// An uploaded document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub id: i64,
    pub avaliacao_id: i64,
    #[sqlx(rename = "tipo")]
    #[serde(rename = "tipo")]
    pub kind: Option<String>,
    #[sqlx(rename = "nome_original")]
    #[serde(rename = "nome_original")]
    pub original_name: Option<String>,
    #[sqlx(rename = "caminho")]
    #[serde(rename = "caminho")]
    pub path: String,
}

/// What an uploaded document is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Certidão de ônus reais
    CertidaoOnus,
    /// Espelho cadastral / imobiliário
    EspelhoCadastral,
    Anexo,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::CertidaoOnus => "certidao_onus",
            DocumentKind::EspelhoCadastral => "espelho_cadastral",
            DocumentKind::Anexo => "anexo",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "certidao_onus" => Ok(DocumentKind::CertidaoOnus),
            "espelho_cadastral" => Ok(DocumentKind::EspelhoCadastral),
            "" | "anexo" => Ok(DocumentKind::Anexo),
            other => Err(format!(
                "Unknown document kind '{}'. Use certidao_onus, espelho_cadastral or anexo",
                other
            )),
        }
    }
}

/// Body of create and update requests
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportPayload {
    #[serde(default)]
    pub dados: Option<Value>,
    #[serde(default)]
    pub areas: Vec<Area>,
    #[serde(default)]
    pub comparativos: Vec<Comparable>,
}

/// Query string of the listing endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub busca: Option<String>,
}

/// One entry of the report listing
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub id: i64,
    pub controle: String,
    pub ano: i64,
    /// Property type and address, for display
    pub titulo: String,
    pub dados: Value,
    pub dados_json: String,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl From<DbReport> for ReportSummary {
    fn from(row: DbReport) -> Self {
        let dados: Value = serde_json::from_str(&row.dados_json).unwrap_or_else(|e| {
            tracing::warn!("Report {} has unreadable data: {}", row.controle, e);
            Value::Object(Default::default())
        });
        let titulo = ReportData::from_value(dados.clone())
            .map(|d| d.title())
            .unwrap_or_default();
        Self {
            id: row.id,
            controle: row.controle,
            ano: row.ano,
            titulo,
            dados,
            dados_json: row.dados_json,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// A report with every child collection
#[derive(Debug, Clone, Serialize)]
pub struct ReportResponse {
    pub id: i64,
    pub controle: String,
    pub ano: i64,
    pub dados: ReportData,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub areas: Vec<Area>,
    pub comparativos: Vec<Comparable>,
    pub fotos: Vec<Photo>,
    pub documentos: Vec<Document>,
}

/// Response of the photo upload endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PhotosResponse {
    pub fotos: Vec<Photo>,
}

/// Response of delete endpoints
#[derive(Debug, Clone, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}
