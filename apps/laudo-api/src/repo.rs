//! Database access for reports and their child rows
//!
//! Every function takes a connection so callers can run several of them in
//! one transaction (`&mut tx` coerces to `&mut SqliteConnection`).

use laudo_core::ControlNumber;
use sqlx::SqliteConnection;

use crate::files::rebase_path;
use crate::models::{Area, Comparable, DbReport, Document, Photo};

const REPORT_COLUMNS: &str = "id, controle, ano, dados_json, created_at, updated_at";

/// Child collections of one report
#[derive(Debug, Default)]
pub struct Children {
    pub areas: Vec<Area>,
    pub comparativos: Vec<Comparable>,
    pub fotos: Vec<Photo>,
    pub documentos: Vec<Document>,
}

/// Issue the next control number for `year`.
///
/// Must run inside the transaction that inserts the report. The per-year
/// counter row is seeded on first use from the highest sequence already
/// present for that year, and a number already taken (rows inserted behind
/// the counter's back) is skipped.
pub async fn allocate_control_number(
    conn: &mut SqliteConnection,
    year: i32,
) -> Result<ControlNumber, sqlx::Error> {
    let counter: Option<i64> =
        sqlx::query_scalar("SELECT ultima FROM sequencias_controle WHERE ano = ?")
            .bind(year)
            .fetch_optional(&mut *conn)
            .await?;

    if counter.is_none() {
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT controle FROM avaliacoes WHERE ano = ?")
                .bind(year)
                .fetch_all(&mut *conn)
                .await?;
        let seed = ControlNumber::next_from_existing(existing.iter().map(String::as_str), year)
            .sequence()
            - 1;
        tracing::debug!("Seeding control sequence for {} at {}", year, seed);
        sqlx::query("INSERT INTO sequencias_controle (ano, ultima) VALUES (?, ?)")
            .bind(year)
            .bind(i64::from(seed))
            .execute(&mut *conn)
            .await?;
    }

    loop {
        let sequence: i64 = sqlx::query_scalar(
            "UPDATE sequencias_controle SET ultima = ultima + 1 WHERE ano = ? RETURNING ultima",
        )
        .bind(year)
        .fetch_one(&mut *conn)
        .await?;

        let sequence = u32::try_from(sequence).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let control = ControlNumber::new(sequence, year);

        let taken: Option<i64> = sqlx::query_scalar("SELECT id FROM avaliacoes WHERE controle = ?")
            .bind(control.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        if taken.is_none() {
            return Ok(control);
        }
        tracing::warn!("Control number {} already in use, skipping", control);
    }
}

pub async fn insert_report(
    conn: &mut SqliteConnection,
    control: &ControlNumber,
    dados_json: &str,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query("INSERT INTO avaliacoes (controle, ano, dados_json) VALUES (?, ?, ?)")
        .bind(control.to_string())
        .bind(control.year())
        .bind(dados_json)
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

pub async fn find_report(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<DbReport>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {} FROM avaliacoes WHERE id = ?", REPORT_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
}

/// List reports newest first, optionally filtered by a substring of the
/// control number or of the raw data document
pub async fn list_reports(
    conn: &mut SqliteConnection,
    search: Option<&str>,
) -> Result<Vec<DbReport>, sqlx::Error> {
    match search.map(str::trim).filter(|s| !s.is_empty()) {
        Some(term) => {
            let pattern = format!("%{}%", term);
            sqlx::query_as(&format!(
                "SELECT {} FROM avaliacoes WHERE controle LIKE ? OR dados_json LIKE ? \
                 ORDER BY created_at DESC, id DESC",
                REPORT_COLUMNS
            ))
            .bind(&pattern)
            .bind(&pattern)
            .fetch_all(&mut *conn)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {} FROM avaliacoes ORDER BY created_at DESC, id DESC",
                REPORT_COLUMNS
            ))
            .fetch_all(&mut *conn)
            .await
        }
    }
}

pub async fn update_report_data(
    conn: &mut SqliteConnection,
    id: i64,
    dados_json: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE avaliacoes SET dados_json = ? WHERE id = ?")
        .bind(dados_json)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Delete a report; child rows go with it through `ON DELETE CASCADE`.
/// Returns whether a row was deleted.
pub async fn delete_report(conn: &mut SqliteConnection, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM avaliacoes WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn replace_areas(
    conn: &mut SqliteConnection,
    report_id: i64,
    areas: &[Area],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM areas WHERE avaliacao_id = ?")
        .bind(report_id)
        .execute(&mut *conn)
        .await?;

    for area in areas {
        let area = area.clone().with_computed_area();
        sqlx::query(
            r#"
            INSERT INTO areas (avaliacao_id, descricao, largura, comprimento, area, tipo)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(report_id)
        .bind(&area.description)
        .bind(area.width)
        .bind(area.length)
        .bind(area.area)
        .bind(&area.category)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn replace_comparables(
    conn: &mut SqliteConnection,
    report_id: i64,
    comparables: &[Comparable],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM comparativos WHERE avaliacao_id = ?")
        .bind(report_id)
        .execute(&mut *conn)
        .await?;

    for item in comparables {
        sqlx::query(
            r#"
            INSERT INTO comparativos
                (avaliacao_id, endereco, valor, area, link, latitude, longitude, observacoes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(report_id)
        .bind(&item.address)
        .bind(item.price)
        .bind(item.area)
        .bind(&item.link)
        .bind(item.latitude)
        .bind(item.longitude)
        .bind(&item.notes)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn load_children(
    conn: &mut SqliteConnection,
    report_id: i64,
) -> Result<Children, sqlx::Error> {
    let areas = sqlx::query_as(
        r#"
        SELECT id, avaliacao_id, descricao, largura, comprimento, area, tipo
        FROM areas WHERE avaliacao_id = ? ORDER BY id
        "#,
    )
    .bind(report_id)
    .fetch_all(&mut *conn)
    .await?;

    let comparativos = sqlx::query_as(
        r#"
        SELECT id, avaliacao_id, endereco, valor, area, link, latitude, longitude, observacoes
        FROM comparativos WHERE avaliacao_id = ? ORDER BY id
        "#,
    )
    .bind(report_id)
    .fetch_all(&mut *conn)
    .await?;

    let fotos = sqlx::query_as(
        r#"
        SELECT id, avaliacao_id, legenda, caminho, COALESCE(ordem, 0) AS ordem
        FROM fotos WHERE avaliacao_id = ? ORDER BY ordem, id
        "#,
    )
    .bind(report_id)
    .fetch_all(&mut *conn)
    .await?;

    let documentos = sqlx::query_as(
        r#"
        SELECT id, avaliacao_id, tipo, nome_original, caminho
        FROM documentos WHERE avaliacao_id = ? ORDER BY id
        "#,
    )
    .bind(report_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Children {
        areas,
        comparativos,
        fotos,
        documentos,
    })
}

/// Next free display position for a report's photos
pub async fn next_photo_order(
    conn: &mut SqliteConnection,
    report_id: i64,
) -> Result<i64, sqlx::Error> {
    let highest: Option<i64> =
        sqlx::query_scalar("SELECT MAX(ordem) FROM fotos WHERE avaliacao_id = ?")
            .bind(report_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(highest.map_or(0, |h| h + 1))
}

pub async fn insert_photo(
    conn: &mut SqliteConnection,
    report_id: i64,
    caption: &str,
    path: &str,
    order: i64,
) -> Result<Photo, sqlx::Error> {
    let result =
        sqlx::query("INSERT INTO fotos (avaliacao_id, legenda, caminho, ordem) VALUES (?, ?, ?, ?)")
            .bind(report_id)
            .bind(caption)
            .bind(path)
            .bind(order)
            .execute(&mut *conn)
            .await?;

    Ok(Photo {
        id: result.last_insert_rowid(),
        avaliacao_id: report_id,
        caption: Some(caption.to_string()),
        path: path.to_string(),
        order,
    })
}

pub async fn insert_document(
    conn: &mut SqliteConnection,
    report_id: i64,
    kind: &str,
    original_name: &str,
    path: &str,
) -> Result<Document, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO documentos (avaliacao_id, tipo, nome_original, caminho) VALUES (?, ?, ?, ?)",
    )
    .bind(report_id)
    .bind(kind)
    .bind(original_name)
    .bind(path)
    .execute(&mut *conn)
    .await?;

    Ok(Document {
        id: result.last_insert_rowid(),
        avaliacao_id: report_id,
        kind: Some(kind.to_string()),
        original_name: Some(original_name.to_string()),
        path: path.to_string(),
    })
}

pub async fn find_photo(conn: &mut SqliteConnection, id: i64) -> Result<Option<Photo>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, avaliacao_id, legenda, caminho, COALESCE(ordem, 0) AS ordem FROM fotos WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn delete_photo(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM fotos WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn find_document(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Document>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, avaliacao_id, tipo, nome_original, caminho FROM documentos WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn delete_document(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM documentos WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Copy every child row of `source` onto `target`, moving attachment paths
/// from `source_control`'s upload directory to `target_control`'s
pub async fn copy_children(
    conn: &mut SqliteConnection,
    source: i64,
    target: i64,
    source_control: &str,
    target_control: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO areas (avaliacao_id, descricao, largura, comprimento, area, tipo)
        SELECT ?, descricao, largura, comprimento, area, tipo
        FROM areas WHERE avaliacao_id = ? ORDER BY id
        "#,
    )
    .bind(target)
    .bind(source)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO comparativos
            (avaliacao_id, endereco, valor, area, link, latitude, longitude, observacoes)
        SELECT ?, endereco, valor, area, link, latitude, longitude, observacoes
        FROM comparativos WHERE avaliacao_id = ? ORDER BY id
        "#,
    )
    .bind(target)
    .bind(source)
    .execute(&mut *conn)
    .await?;

    let children = load_children(&mut *conn, source).await?;

    for photo in children.fotos {
        sqlx::query("INSERT INTO fotos (avaliacao_id, legenda, caminho, ordem) VALUES (?, ?, ?, ?)")
            .bind(target)
            .bind(&photo.caption)
            .bind(rebase_path(&photo.path, source_control, target_control))
            .bind(photo.order)
            .execute(&mut *conn)
            .await?;
    }

    for document in children.documentos {
        sqlx::query(
            "INSERT INTO documentos (avaliacao_id, tipo, nome_original, caminho) VALUES (?, ?, ?, ?)",
        )
        .bind(target)
        .bind(&document.kind)
        .bind(&document.original_name)
        .bind(rebase_path(&document.path, source_control, target_control))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}
