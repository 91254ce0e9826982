//! Typed report data
//!
//! The report body is stored as one JSON document per report. This module
//! gives it an explicit shape: one struct per form section, every field
//! defaulted, unknown top-level keys preserved. Documents carry a
//! `schemaVersion`; older documents are upgraded by [`migrate`] before they
//! are decoded.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::CoreError;
use crate::lenient;

/// Version written by this build
pub const CURRENT_SCHEMA_VERSION: u64 = 1;

pub const DEFAULT_METHODOLOGY: &str = "Método Comparativo Direto de Dados de Mercado";
pub const DEFAULT_STANDARD: &str = "ABNT NBR 14.653 - Avaliação de Bens";

/// Declares a section made only of free-text fields.
macro_rules! text_section {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $field:ident => $wire:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            $(
                #[serde(rename = $wire, deserialize_with = "lenient::text")]
                pub $field: String,
            )*
        }
    };
}

/// Report header (`cabecalho`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    #[serde(rename = "logotipoUrl", deserialize_with = "lenient::text")]
    pub logo_url: String,
    #[serde(rename = "responsavel", deserialize_with = "lenient::text")]
    pub responsible: String,
    #[serde(rename = "creci", deserialize_with = "lenient::text")]
    pub creci: String,
    #[serde(rename = "art", deserialize_with = "lenient::text")]
    pub art: String,
    /// ISO date (`YYYY-MM-DD`)
    #[serde(rename = "dataLaudo", deserialize_with = "lenient::text")]
    pub report_date: String,
    #[serde(rename = "observacoes", deserialize_with = "lenient::text")]
    pub notes: String,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            logo_url: String::new(),
            responsible: String::new(),
            creci: String::new(),
            art: String::new(),
            report_date: Utc::now().format("%Y-%m-%d").to_string(),
            notes: String::new(),
        }
    }
}

text_section! {
    /// 1. Property identification (`identificacaoImovel`)
    pub struct PropertyIdentification {
        address => "endereco",
        registration => "matricula",
        owner => "proprietario",
        property_type => "tipo",
        purpose => "finalidade",
        municipality => "municipio",
        state => "uf",
        registry_office => "cartorio",
        municipal_registration => "inscricaoMunicipal",
        occupancy => "ocupacao",
        coordinates => "coordenadas",
    }
}

text_section! {
    /// 2. Requester identification (`identificacaoSolicitante`)
    pub struct Requester {
        name => "nome",
        document => "documento",
        contact => "contato",
        address => "endereco",
        requester_type => "tipoSolicitante",
    }
}

text_section! {
    /// 3. Location and access (`localizacaoAcessos`)
    pub struct LocationAccess {
        description => "descricao",
        access_routes => "viasAcesso",
        infrastructure => "infraestrutura",
        surroundings => "entorno",
    }
}

text_section! {
    /// 6. Construction characteristics (`caracteristicasConstrucao`)
    pub struct Construction {
        building_standard => "padraoConstrutivo",
        materials => "materiais",
        condition => "conservacao",
        apparent_age => "idadeAparente",
        installations => "instalacoes",
        notes => "observacoes",
    }
}

text_section! {
    /// 7. Appraised unit (`unidadeAvaliada`)
    pub struct AppraisedUnit {
        description => "descricao",
        private_area => "areaPrivativa",
        common_area => "areaComum",
        total_area => "areaTotal",
        notes => "observacoes",
    }
}

/// 8. Valuation (`calculoAvaliacao`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Valuation {
    #[serde(rename = "areaTotal", deserialize_with = "lenient::text")]
    pub total_area: String,
    #[serde(rename = "valorUnitario", deserialize_with = "lenient::number")]
    pub unit_value: Option<f64>,
    #[serde(rename = "valorTotal", deserialize_with = "lenient::number")]
    pub total_value: Option<f64>,
    #[serde(rename = "metodologia", deserialize_with = "lenient::text")]
    pub methodology: String,
    #[serde(rename = "enquadramentoNormas", deserialize_with = "lenient::text")]
    pub standards: String,
}

impl Default for Valuation {
    fn default() -> Self {
        Self {
            total_area: String::new(),
            unit_value: None,
            total_value: None,
            methodology: DEFAULT_METHODOLOGY.to_string(),
            standards: DEFAULT_STANDARD.to_string(),
        }
    }
}

text_section! {
    /// 10. Photo report (`relatorioFotografico`)
    pub struct PhotoReport {
        general_remarks => "consideracoesGerais",
    }
}

text_section! {
    /// 11. Market research (`pesquisaMercado`)
    pub struct MarketResearch {
        summary => "resumo",
        notes => "observacoes",
    }
}

text_section! {
    /// 12. Comparison map (`mapaComparativo`)
    pub struct ComparisonMap {
        latitude => "latitude",
        longitude => "longitude",
        api_key => "apiKey",
    }
}

text_section! {
    /// Notes attached to a document section (lien certificate, cadastral mirror)
    pub struct Remarks {
        notes => "observacoes",
    }
}

text_section! {
    /// Footer and technical responsibility (`rodape`)
    pub struct Footer {
        technical_lead => "responsavelTecnico",
        professional_registration => "registroProfissional",
        digital_signature => "assinaturaDigital",
        validity => "validadeLaudo",
    }
}

/// The full report data document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportData {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u64,
    #[serde(rename = "cabecalho")]
    pub header: Header,
    #[serde(rename = "identificacaoImovel")]
    pub property: PropertyIdentification,
    #[serde(rename = "identificacaoSolicitante")]
    pub requester: Requester,
    #[serde(rename = "localizacaoAcessos")]
    pub location: LocationAccess,
    #[serde(rename = "caracteristicasRegiao", deserialize_with = "lenient::text")]
    pub region: String,
    #[serde(rename = "situacaoTerreno", deserialize_with = "lenient::text")]
    pub land_situation: String,
    #[serde(rename = "caracteristicasConstrucao")]
    pub construction: Construction,
    #[serde(rename = "unidadeAvaliada")]
    pub unit: AppraisedUnit,
    #[serde(rename = "calculoAvaliacao")]
    pub valuation: Valuation,
    #[serde(rename = "criteriosMetodologia", deserialize_with = "lenient::text")]
    pub methodology_criteria: String,
    #[serde(rename = "relatorioFotografico")]
    pub photo_report: PhotoReport,
    #[serde(rename = "pesquisaMercado")]
    pub market_research: MarketResearch,
    #[serde(rename = "mapaComparativo")]
    pub comparison_map: ComparisonMap,
    #[serde(rename = "certidaoOnus")]
    pub lien_certificate: Remarks,
    #[serde(rename = "espelhoCadastral")]
    pub cadastral_mirror: Remarks,
    #[serde(rename = "rodape")]
    pub footer: Footer,
    /// Keys written by newer or customised clients
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ReportData {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            header: Header::default(),
            property: PropertyIdentification::default(),
            requester: Requester::default(),
            location: LocationAccess::default(),
            region: String::new(),
            land_situation: String::new(),
            construction: Construction::default(),
            unit: AppraisedUnit::default(),
            valuation: Valuation::default(),
            methodology_criteria: String::new(),
            photo_report: PhotoReport::default(),
            market_research: MarketResearch::default(),
            comparison_map: ComparisonMap::default(),
            lien_certificate: Remarks::default(),
            cadastral_mirror: Remarks::default(),
            footer: Footer::default(),
            extra: Map::new(),
        }
    }
}

impl ReportData {
    /// The default skeleton as JSON, covering every known field
    pub fn skeleton() -> Value {
        Self::default().to_value()
    }

    /// Decode a stored or submitted document, upgrading older schemas first.
    ///
    /// Anything that is not a JSON object decodes as the default skeleton. A
    /// section of the wrong shape (`"certidaoOnus": ""`) falls back to its
    /// default instead of failing the whole document.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let mut map = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        migrate(&mut map)?;
        for (key, check) in SECTIONS {
            let Some(section) = map.get(*key) else {
                continue;
            };
            if let Err(e) = check(section) {
                warn!("Resetting malformed report section {}: {}", key, e);
                map.remove(*key);
            }
        }
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    /// Decode from the raw text stored in the database.
    ///
    /// Empty text is treated as an empty document.
    pub fn from_json_str(raw: &str) -> Result<Self, CoreError> {
        if raw.trim().is_empty() {
            return Self::from_value(Value::Null);
        }
        Self::from_value(serde_json::from_str(raw)?)
    }

    pub fn to_value(&self) -> Value {
        // Infallible: every map key is a string
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Short description used in listings: property type and address
    pub fn title(&self) -> String {
        match (self.property.property_type.trim(), self.property.address.trim()) {
            ("", "") => String::new(),
            (kind, "") => kind.to_string(),
            ("", address) => address.to_string(),
            (kind, address) => format!("{} - {}", kind, address),
        }
    }
}

type SectionCheck = fn(&Value) -> Result<(), serde_json::Error>;

/// Every known top-level key with a check that its value decodes
const SECTIONS: &[(&str, SectionCheck)] = &[
    ("cabecalho", fits::<Header> as SectionCheck),
    ("identificacaoImovel", fits::<PropertyIdentification> as SectionCheck),
    ("identificacaoSolicitante", fits::<Requester> as SectionCheck),
    ("localizacaoAcessos", fits::<LocationAccess> as SectionCheck),
    ("caracteristicasRegiao", fits_text as SectionCheck),
    ("situacaoTerreno", fits_text as SectionCheck),
    ("caracteristicasConstrucao", fits::<Construction> as SectionCheck),
    ("unidadeAvaliada", fits::<AppraisedUnit> as SectionCheck),
    ("calculoAvaliacao", fits::<Valuation> as SectionCheck),
    ("criteriosMetodologia", fits_text as SectionCheck),
    ("relatorioFotografico", fits::<PhotoReport> as SectionCheck),
    ("pesquisaMercado", fits::<MarketResearch> as SectionCheck),
    ("mapaComparativo", fits::<ComparisonMap> as SectionCheck),
    ("certidaoOnus", fits::<Remarks> as SectionCheck),
    ("espelhoCadastral", fits::<Remarks> as SectionCheck),
    ("rodape", fits::<Footer> as SectionCheck),
];

fn fits<T: DeserializeOwned>(value: &Value) -> Result<(), serde_json::Error> {
    T::deserialize(value).map(drop)
}

fn fits_text(value: &Value) -> Result<(), serde_json::Error> {
    lenient::text(value).map(drop)
}

/// Upgrade a raw document in place to [`CURRENT_SCHEMA_VERSION`].
///
/// Documents without `schemaVersion` are version 0.
pub fn migrate(doc: &mut Map<String, Value>) -> Result<(), CoreError> {
    let found = doc
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    if found > CURRENT_SCHEMA_VERSION {
        return Err(CoreError::UnsupportedSchema {
            found,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if found < 1 {
        migrate_v0_currency(doc);
    }

    doc.insert(
        "schemaVersion".to_string(),
        Value::from(CURRENT_SCHEMA_VERSION),
    );
    Ok(())
}

/// v0 clients stored amounts as typed (`"1.500,00"`, `"4500.50"`); v1 stores
/// numbers. Both are read with the same rule as submitted form values.
fn migrate_v0_currency(doc: &mut Map<String, Value>) {
    let Some(Value::Object(valuation)) = doc.get_mut("calculoAvaliacao") else {
        return;
    };
    for key in ["valorUnitario", "valorTotal"] {
        if let Some(slot) = valuation.get_mut(key) {
            let parsed = match &*slot {
                Value::String(raw) => lenient::parse_decimal(raw)
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                _ => continue,
            };
            *slot = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_skeleton_has_every_section() {
        let skeleton = ReportData::skeleton();
        for key in [
            "cabecalho",
            "identificacaoImovel",
            "identificacaoSolicitante",
            "localizacaoAcessos",
            "caracteristicasRegiao",
            "situacaoTerreno",
            "caracteristicasConstrucao",
            "unidadeAvaliada",
            "calculoAvaliacao",
            "criteriosMetodologia",
            "relatorioFotografico",
            "pesquisaMercado",
            "mapaComparativo",
            "certidaoOnus",
            "espelhoCadastral",
            "rodape",
        ] {
            assert!(skeleton.get(key).is_some(), "missing section {}", key);
        }
        assert_eq!(skeleton["schemaVersion"], json!(CURRENT_SCHEMA_VERSION));
        assert_eq!(skeleton["calculoAvaliacao"]["metodologia"], json!(DEFAULT_METHODOLOGY));
    }

    #[test]
    fn test_partial_document_is_completed() {
        let data = ReportData::from_value(json!({
            "identificacaoImovel": { "endereco": "Rua A, 10" }
        }))
        .unwrap();

        assert_eq!(data.property.address, "Rua A, 10");
        assert_eq!(data.property.registration, "");
        assert_eq!(data.valuation.standards, DEFAULT_STANDARD);
        assert_eq!(data.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_non_object_is_skeleton() {
        let data = ReportData::from_value(Value::Null).unwrap();
        assert_eq!(data.valuation.methodology, DEFAULT_METHODOLOGY);
        assert_eq!(ReportData::from_json_str("").unwrap().footer, Footer::default());
    }

    #[test]
    fn test_v0_currency_migrated() {
        let data = ReportData::from_value(json!({
            "calculoAvaliacao": { "valorUnitario": "R$ 4.500,00", "valorTotal": "" }
        }))
        .unwrap();

        assert_eq!(data.valuation.unit_value, Some(4500.0));
        assert_eq!(data.valuation.total_value, None);
    }

    #[test]
    fn test_v0_plain_decimals_keep_their_scale() {
        let legacy = ReportData::from_value(json!({
            "calculoAvaliacao": { "valorUnitario": "4500.50", "valorTotal": "1.500" }
        }))
        .unwrap();
        assert_eq!(legacy.valuation.unit_value, Some(4500.5));
        assert_eq!(legacy.valuation.total_value, Some(1.5));

        let current = ReportData::from_value(json!({
            "schemaVersion": 1,
            "calculoAvaliacao": { "valorUnitario": "4500.50", "valorTotal": "1.500" }
        }))
        .unwrap();
        assert_eq!(current.valuation, legacy.valuation);
    }

    #[test]
    fn test_malformed_sections_fall_back_to_defaults() {
        let data = ReportData::from_json_str(
            r#"{
                "certidaoOnus": "",
                "caracteristicasRegiao": ["a"],
                "identificacaoImovel": { "endereco": "Rua A" },
                "rodape": { "responsavelTecnico": ["x"] }
            }"#,
        )
        .unwrap();

        assert_eq!(data.lien_certificate, Remarks::default());
        assert_eq!(data.region, "");
        assert_eq!(data.footer, Footer::default());
        assert_eq!(data.property.address, "Rua A");
        assert!(data.extra.is_empty());
    }

    #[test]
    fn test_v1_numbers_untouched() {
        let data = ReportData::from_value(json!({
            "schemaVersion": 1,
            "calculoAvaliacao": { "valorUnitario": 1.5 }
        }))
        .unwrap();
        assert_eq!(data.valuation.unit_value, Some(1.5));
    }

    #[test]
    fn test_future_schema_rejected() {
        let err = ReportData::from_value(json!({ "schemaVersion": 99 })).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedSchema { found: 99, .. }));
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let data = ReportData::from_value(json!({
            "anexosExtras": { "nota": "x" }
        }))
        .unwrap();
        let back = data.to_value();
        assert_eq!(back["anexosExtras"], json!({ "nota": "x" }));
    }

    #[test]
    fn test_numeric_text_fields_coerced() {
        let data = ReportData::from_value(json!({
            "unidadeAvaliada": { "areaTotal": 120 }
        }))
        .unwrap();
        assert_eq!(data.unit.total_area, "120");
    }

    #[test]
    fn test_title() {
        let mut data = ReportData::default();
        assert_eq!(data.title(), "");
        data.property.property_type = "Casa".into();
        data.property.address = "Rua B".into();
        assert_eq!(data.title(), "Casa - Rua B");
    }
}
