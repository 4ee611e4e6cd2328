use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{quoted_sheet, CellFormat, CellRef, GridRange, StoreError, TableStore, ValueInput};

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub api_base: String,
    pub spreadsheet_id: String,
    pub token: String,
    pub timeout: Duration,
}

/// Extract the spreadsheet id from a `.../spreadsheets/d/<id>/...` URL.
pub fn spreadsheet_id_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/spreadsheets/d/")?;
    let id: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Google Sheets v4 REST implementation of [`TableStore`].
pub struct SheetsTableStore {
    client: reqwest::Client,
    config: SheetsConfig,
    sheet_ids: Mutex<HashMap<String, i64>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<Value>,
}

impl SheetsTableStore {
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        if config.spreadsheet_id.trim().is_empty() {
            return Err(anyhow!("spreadsheet id is empty"));
        }
        Url::parse(&config.api_base).with_context(|| format!("invalid sheets api base {}", config.api_base))?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building sheets client")?;
        Ok(Self {
            client,
            config,
            sheet_ids: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|err| StoreError::Decode(format!("api base: {err}")))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StoreError::Decode("api base cannot carry a path".to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn values_endpoint(&self, range: &str, suffix: &str) -> Result<Url, StoreError> {
        let id = self.config.spreadsheet_id.as_str();
        let last = format!("{range}{suffix}");
        self.endpoint(&[id, "values", &last])
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        sheet: &str,
    ) -> Result<Value, StoreError> {
        debug!(%method, sheet, path = url.path(), "sheets request");
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.config.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        if !status.is_success() {
            return Err(status_error(status, text, sheet));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| StoreError::Decode(err.to_string()))
    }

    async fn batch_update(&self, requests: Value, sheet: &str) -> Result<BatchUpdateResponse, StoreError> {
        let op = format!("{}:batchUpdate", self.config.spreadsheet_id);
        let url = self.endpoint(&[op.as_str()])?;
        let value = self
            .send(Method::POST, url, Some(json!({ "requests": requests })), sheet)
            .await?;
        serde_json::from_value(value).map_err(|err| StoreError::Decode(err.to_string()))
    }

    async fn load_sheet_ids(&self) -> Result<HashMap<String, i64>, StoreError> {
        let mut url = self.endpoint(&[self.config.spreadsheet_id.as_str()])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");
        let value = self.send(Method::GET, url, None, "").await?;
        let meta: SpreadsheetMeta =
            serde_json::from_value(value).map_err(|err| StoreError::Decode(err.to_string()))?;
        let ids: HashMap<String, i64> = meta
            .sheets
            .into_iter()
            .map(|entry| (entry.properties.title, entry.properties.sheet_id))
            .collect();
        *self.sheet_ids.lock().await = ids.clone();
        Ok(ids)
    }

    async fn sheet_id(&self, sheet: &str) -> Result<i64, StoreError> {
        if let Some(id) = self.sheet_ids.lock().await.get(sheet) {
            return Ok(*id);
        }
        self.load_sheet_ids()
            .await?
            .get(sheet)
            .copied()
            .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))
    }

    async fn write_values(
        &self,
        sheet: &str,
        range: String,
        rows: Vec<Vec<String>>,
        input: ValueInput,
    ) -> Result<(), StoreError> {
        let mut url = self.values_endpoint(&range, "")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", value_input_option(input));
        let body = json!({ "range": range, "majorDimension": "ROWS", "values": rows });
        self.send(Method::PUT, url, Some(body), sheet).await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for SheetsTableStore {
    async fn sheet_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.load_sheet_ids().await?.into_keys().collect();
        names.sort();
        Ok(names)
    }

    async fn ensure_sheet(&self, sheet: &str, rows: u32, columns: u32) -> Result<bool, StoreError> {
        if self.load_sheet_ids().await?.contains_key(sheet) {
            return Ok(false);
        }
        let request = json!([{
            "addSheet": {
                "properties": {
                    "title": sheet,
                    "gridProperties": { "rowCount": rows, "columnCount": columns }
                }
            }
        }]);
        let response = self.batch_update(request, sheet).await?;
        let created_id = response
            .replies
            .first()
            .and_then(|reply| reply.pointer("/addSheet/properties/sheetId"))
            .and_then(Value::as_i64);
        if let Some(id) = created_id {
            self.sheet_ids.lock().await.insert(sheet.to_string(), id);
        }
        Ok(true)
    }

    async fn read_all(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let mut url = self.values_endpoint(&quoted_sheet(sheet), "")?;
        url.query_pairs_mut()
            .append_pair("valueRenderOption", "FORMULA")
            .append_pair("majorDimension", "ROWS");
        let value = self.send(Method::GET, url, None, sheet).await?;
        let range: ValueRange =
            serde_json::from_value(value).map_err(|err| StoreError::Decode(err.to_string()))?;
        Ok(range
            .values
            .iter()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect())
    }

    async fn append_row(&self, sheet: &str, values: &[String]) -> Result<(), StoreError> {
        let range = format!("{}!A1", quoted_sheet(sheet));
        let mut url = self.values_endpoint(&range, ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        let body = json!({ "majorDimension": "ROWS", "values": [values] });
        self.send(Method::POST, url, Some(body), sheet).await?;
        Ok(())
    }

    async fn update_row(&self, sheet: &str, row: usize, values: &[String]) -> Result<(), StoreError> {
        let range = format!(
            "{}!{}",
            quoted_sheet(sheet),
            GridRange::row(row, values.len()).a1()
        );
        self.write_values(sheet, range, vec![values.to_vec()], ValueInput::Raw)
            .await
    }

    async fn update_cell(
        &self,
        sheet: &str,
        cell: CellRef,
        value: &str,
        input: ValueInput,
    ) -> Result<(), StoreError> {
        let range = format!("{}!{}", quoted_sheet(sheet), cell.a1());
        self.write_values(sheet, range, vec![vec![value.to_string()]], input)
            .await
    }

    async fn format_range(
        &self,
        sheet: &str,
        range: GridRange,
        format: &CellFormat,
    ) -> Result<(), StoreError> {
        let sheet_id = self.sheet_id(sheet).await?;
        let request = json!([{
            "repeatCell": {
                "range": {
                    "sheetId": sheet_id,
                    "startRowIndex": range.first_row.saturating_sub(1),
                    "endRowIndex": range.last_row,
                    "startColumnIndex": range.first_column,
                    "endColumnIndex": range.last_column + 1
                },
                "cell": { "userEnteredFormat": user_entered_format(format) },
                "fields": "userEnteredFormat(textFormat,horizontalAlignment,backgroundColor)"
            }
        }]);
        self.batch_update(request, sheet).await?;
        Ok(())
    }
}

fn value_input_option(input: ValueInput) -> &'static str {
    match input {
        ValueInput::Raw => "RAW",
        ValueInput::UserEntered => "USER_ENTERED",
    }
}

fn status_error(status: StatusCode, body: String, sheet: &str) -> StoreError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return StoreError::Quota(body);
    }
    if status == StatusCode::BAD_REQUEST && body.contains("Unable to parse range") {
        return StoreError::SheetNotFound(sheet.to_string());
    }
    StoreError::Api {
        status: status.as_u16(),
        message: body,
    }
}

fn user_entered_format(format: &CellFormat) -> Value {
    let mut text_format = json!({ "bold": format.bold, "fontSize": format.font_size });
    if let Some(family) = &format.font_family {
        text_format["fontFamily"] = json!(family);
    }
    let mut out = json!({ "textFormat": text_format });
    if format.centered {
        out["horizontalAlignment"] = json!("CENTER");
    }
    if let Some([red, green, blue]) = format.background {
        out["backgroundColor"] = json!({ "red": red, "green": green, "blue": blue });
    }
    out
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        other => other.to_string(),
    }
}
