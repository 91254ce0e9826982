//! HTTP handlers for the laudo API

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Datelike, Local};
use laudo_core::ReportData;
use serde_json::Value;
use sqlx::SqliteConnection;

use crate::error::ApiError;
use crate::files::{UploadStore, PHOTOS_DIR};
use crate::models::*;
use crate::repo;
use crate::state::AppState;

/// Most photos accepted in one upload request
pub const MAX_PHOTOS_PER_UPLOAD: usize = 20;

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// List reports, newest first
pub async fn list_reports(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ReportSummary>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    let rows = repo::list_reports(&mut conn, query.busca.as_deref()).await?;
    Ok(Json(rows.into_iter().map(ReportSummary::from).collect()))
}

/// Get one report with its child collections
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ReportResponse>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(load_report(&mut conn, id).await?))
}

/// Create a report under the next control number of the current year
pub async fn create_report(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReportPayload>,
) -> Result<(StatusCode, Json<ReportResponse>), ApiError> {
    let dados_json = normalize_data(payload.dados.unwrap_or(Value::Null))?;
    let year = Local::now().year();

    let mut tx = state.db.begin().await?;
    let control = repo::allocate_control_number(&mut tx, year).await?;
    let id = repo::insert_report(&mut tx, &control, &dados_json).await?;
    repo::replace_areas(&mut tx, id, &payload.areas).await?;
    repo::replace_comparables(&mut tx, id, &payload.comparativos).await?;
    let report = load_report(&mut tx, id).await?;
    tx.commit().await?;

    tracing::info!("Created report {} (id {})", control, id);
    Ok((StatusCode::CREATED, Json(report)))
}

/// Replace a report's data and its areas and comparables.
///
/// A body without `dados` keeps the stored document.
pub async fn update_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<ReportPayload>,
) -> Result<Json<ReportResponse>, ApiError> {
    let dados_json = payload.dados.map(normalize_data).transpose()?;

    let mut tx = state.db.begin().await?;
    let row = repo::find_report(&mut tx, id)
        .await?
        .ok_or(ApiError::NotFound("Report"))?;
    if let Some(dados_json) = &dados_json {
        repo::update_report_data(&mut tx, id, dados_json).await?;
    }
    repo::replace_areas(&mut tx, id, &payload.areas).await?;
    repo::replace_comparables(&mut tx, id, &payload.comparativos).await?;
    let report = load_report(&mut tx, id).await?;
    tx.commit().await?;

    tracing::info!("Updated report {}", row.controle);
    Ok(Json(report))
}

/// Copy a report, its child rows and its attachments under a new control
/// number
pub async fn duplicate_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<ReportResponse>), ApiError> {
    let mut tx = state.db.begin().await?;
    let source = repo::find_report(&mut tx, id)
        .await?
        .ok_or(ApiError::NotFound("Report"))?;

    let control = repo::allocate_control_number(&mut tx, Local::now().year()).await?;
    let target = control.to_string();
    let new_id = repo::insert_report(&mut tx, &control, &source.dados_json).await?;
    repo::copy_children(&mut tx, source.id, new_id, &source.controle, &target).await?;
    let report = load_report(&mut tx, new_id).await?;

    let copied = match state.uploads.copy_report_tree(&source.controle, &target).await {
        Ok(copied) => copied,
        Err(e) => {
            discard_report_dir(&state.uploads, &target).await;
            return Err(e.into());
        }
    };
    if let Err(e) = tx.commit().await {
        discard_report_dir(&state.uploads, &target).await;
        return Err(e.into());
    }

    tracing::info!(
        "Duplicated report {} as {} ({} files copied)",
        source.controle,
        target,
        copied
    );
    Ok((StatusCode::CREATED, Json(report)))
}

/// Delete a report, its child rows and its attachments
pub async fn delete_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let mut tx = state.db.begin().await?;
    let row = repo::find_report(&mut tx, id)
        .await?
        .ok_or(ApiError::NotFound("Report"))?;
    repo::delete_report(&mut tx, id).await?;
    tx.commit().await?;

    discard_report_dir(&state.uploads, &row.controle).await;
    tracing::info!("Deleted report {}", row.controle);
    Ok(Json(SuccessResponse { success: true }))
}

/// Upload photos for a report.
///
/// Multipart fields: `avaliacaoId`, up to 20 `fotos` files and an optional
/// `legenda_{i}` caption for the i-th photo (defaults to the file name).
pub async fn upload_photos(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<PhotosResponse>, ApiError> {
    let form = UploadForm::read(multipart).await?;
    let report_id = form.report_id()?;
    let photos: Vec<&UploadedFile> = form.files_named("fotos").collect();
    if photos.len() > MAX_PHOTOS_PER_UPLOAD {
        return Err(ApiError::InvalidRequest(format!(
            "At most {} photos per upload",
            MAX_PHOTOS_PER_UPLOAD
        )));
    }

    let mut stored = Vec::new();
    let outcome = async {
        let mut tx = state.db.begin().await?;
        let report = repo::find_report(&mut tx, report_id)
            .await?
            .ok_or(ApiError::NotFound("Report"))?;
        let first_order = repo::next_photo_order(&mut tx, report_id).await?;

        let mut fotos = Vec::with_capacity(photos.len());
        for (index, file) in photos.iter().enumerate() {
            let caption = form
                .field(&format!("legenda_{}", index))
                .unwrap_or(file.file_name.as_str())
                .to_string();
            let path = state
                .uploads
                .store(&report.controle, PHOTOS_DIR, &file.file_name, &file.bytes)
                .await?;
            stored.push(path.clone());
            let order = first_order + index as i64;
            fotos.push(repo::insert_photo(&mut tx, report_id, &caption, &path, order).await?);
        }
        tx.commit().await?;
        Ok::<_, ApiError>(fotos)
    }
    .await;

    match outcome {
        Ok(fotos) => {
            tracing::info!("Stored {} photos for report {}", fotos.len(), report_id);
            Ok(Json(PhotosResponse { fotos }))
        }
        Err(e) => {
            discard_files(&state.uploads, &stored).await;
            Err(e)
        }
    }
}

/// Upload one document for a report.
///
/// Multipart fields: `avaliacaoId`, `tipo` (`certidao_onus`,
/// `espelho_cadastral` or `anexo`, the default) and a `documento` file.
pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Document>, ApiError> {
    let form = UploadForm::read(multipart).await?;
    let report_id = form.report_id()?;
    let kind: DocumentKind = form
        .field("tipo")
        .unwrap_or_default()
        .parse()
        .map_err(ApiError::InvalidRequest)?;
    let file = form
        .files_named("documento")
        .next()
        .ok_or_else(|| ApiError::InvalidRequest("No file received".into()))?;

    let mut stored = None;
    let outcome = async {
        let mut tx = state.db.begin().await?;
        let report = repo::find_report(&mut tx, report_id)
            .await?
            .ok_or(ApiError::NotFound("Report"))?;
        let path = state
            .uploads
            .store(&report.controle, kind.as_str(), &file.file_name, &file.bytes)
            .await?;
        stored = Some(path.clone());
        let document =
            repo::insert_document(&mut tx, report_id, kind.as_str(), &file.file_name, &path)
                .await?;
        tx.commit().await?;
        Ok::<_, ApiError>(document)
    }
    .await;

    match outcome {
        Ok(document) => {
            tracing::info!("Stored {} document for report {}", kind, report_id);
            Ok(Json(document))
        }
        Err(e) => {
            discard_files(&state.uploads, stored.as_slice()).await;
            Err(e)
        }
    }
}

/// Delete a photo row and its file
pub async fn delete_photo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let mut conn = state.db.acquire().await?;
    let photo = repo::find_photo(&mut conn, id)
        .await?
        .ok_or(ApiError::NotFound("Photo"))?;
    repo::delete_photo(&mut conn, id).await?;
    drop(conn);

    discard_files(&state.uploads, &[photo.path]).await;
    tracing::info!("Deleted photo {}", id);
    Ok(Json(SuccessResponse { success: true }))
}

/// Delete a document row and its file
pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let mut conn = state.db.acquire().await?;
    let document = repo::find_document(&mut conn, id)
        .await?
        .ok_or(ApiError::NotFound("Document"))?;
    repo::delete_document(&mut conn, id).await?;
    drop(conn);

    discard_files(&state.uploads, &[document.path]).await;
    tracing::info!("Deleted document {}", id);
    Ok(Json(SuccessResponse { success: true }))
}

/// Validate submitted report data and return the JSON text to store
fn normalize_data(dados: Value) -> Result<String, ApiError> {
    let data = ReportData::from_value(dados)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid report data: {}", e)))?;
    serde_json::to_string(&data).map_err(|e| ApiError::Internal(e.into()))
}

async fn load_report(conn: &mut SqliteConnection, id: i64) -> Result<ReportResponse, ApiError> {
    let row = repo::find_report(&mut *conn, id)
        .await?
        .ok_or(ApiError::NotFound("Report"))?;
    let dados = ReportData::from_json_str(&row.dados_json).map_err(|e| {
        ApiError::Internal(anyhow::anyhow!("Report {} has unreadable data: {}", row.controle, e))
    })?;
    let children = repo::load_children(&mut *conn, id).await?;

    Ok(ReportResponse {
        id: row.id,
        controle: row.controle,
        ano: row.ano,
        dados,
        created_at: row.created_at,
        updated_at: row.updated_at,
        areas: children.areas,
        comparativos: children.comparativos,
        fotos: children.fotos,
        documentos: children.documentos,
    })
}

async fn discard_files(uploads: &UploadStore, paths: &[String]) {
    for path in paths {
        if let Err(e) = uploads.remove_file(path).await {
            tracing::warn!("Failed to remove {}: {}", path, e);
        }
    }
}

async fn discard_report_dir(uploads: &UploadStore, control: &str) {
    if let Err(e) = uploads.remove_report_dir(control).await {
        tracing::warn!("Failed to remove attachments of {}: {}", control, e);
    }
}

struct UploadedFile {
    field: String,
    file_name: String,
    bytes: Bytes,
}

/// A fully buffered multipart form
#[derive(Default)]
struct UploadForm {
    fields: HashMap<String, String>,
    files: Vec<UploadedFile>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let bytes = field.bytes().await?;
                    form.files.push(UploadedFile {
                        field: name,
                        file_name,
                        bytes,
                    });
                }
                None => {
                    let text = field.text().await?;
                    form.fields.insert(name, text);
                }
            }
        }
        Ok(form)
    }

    /// A non-blank text field
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn files_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a UploadedFile> + 'a {
        self.files.iter().filter(move |f| f.field == name)
    }

    fn report_id(&self) -> Result<i64, ApiError> {
        self.field("avaliacaoId")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ApiError::InvalidRequest("avaliacaoId is required".into()))
    }
}
