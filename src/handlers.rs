//! Command handlers, one function per command.
//!
//! Shared conventions: typed arguments come from the parsed values;
//! binary payloads come from the raw request's exact view; every
//! mutation bumps the store set's dirty counter; optional response
//! fields are present only when meaningful.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value as Json;
use tracing::debug;

use crate::command::{CmdContext, CommandError, CommandRegistry, HandlerFuture, Values};
use crate::escape::{parse_token_path, parse_token_pattern};
use crate::tree::{token_path, JsonOptions, SetExFlags, StoreAddress};
use crate::value::NativeValue;

const DEFAULT_ENUM_LIMIT: usize = 10000;

const NS_PER_SEC: i64 = 1_000_000_000;

// ── Shared helpers ────────────────────────────────────────────────────────────

fn key_arg(ctx: &CmdContext, name: &str) -> Result<Vec<String>, CommandError> {
    let path = ctx
        .values
        .str(name)
        .ok_or_else(|| CommandError::msg(format!("missing argument <{name}>")))?;
    Ok(parse_token_path(path))
}

fn str_arg<'a>(ctx: &'a CmdContext, name: &str) -> Result<&'a str, CommandError> {
    ctx.values
        .str(name)
        .ok_or_else(|| CommandError::msg(format!("missing argument <{name}>")))
}

fn int_arg(ctx: &CmdContext, name: &str) -> Result<i64, CommandError> {
    ctx.values
        .int(name)
        .ok_or_else(|| CommandError::msg(format!("missing argument <{name}>")))
}

/// Place an encoded value in the response, as `value`/`type` or with a
/// prefix (`original_value`/`original_type`).
fn add_value_to_response(ctx: &mut CmdContext, value: &NativeValue, prefix: &str) {
    let (escaped, value_type) = value.encode();
    if prefix.is_empty() {
        ctx.set("value", escaped);
        ctx.set("type", value_type);
    } else {
        ctx.set(format!("{prefix}_value").as_str(), escaped);
        ctx.set(format!("{prefix}_type").as_str(), value_type);
    }
}

/// The `--sec`/`--ns` pair: seconds scale to nanoseconds; positive is
/// absolute epoch, negative relative (resolved by the engine).
fn expire_arg(values: &Values) -> i64 {
    if values.flag("--sec") {
        values.int("sec").unwrap_or(0).saturating_mul(NS_PER_SEC)
    } else if values.flag("--ns") {
        values.int("ns").unwrap_or(0)
    } else {
        0
    }
}

fn enum_window(values: &Values) -> (usize, usize) {
    let start = if values.flag("--start") {
        values.int("start").unwrap_or(0).max(0) as usize
    } else {
        0
    };
    let limit = if values.flag("--limit") {
        values.int("limit").unwrap_or(0).max(0) as usize
    } else {
        DEFAULT_ENUM_LIMIT
    };
    (start, limit)
}

fn json_opts(values: &Values) -> JsonOptions {
    JsonOptions { string_values_as_keys: values.flag("--straskey") }
}

/// The JSON payload argument, optionally base64-wrapped.
fn json_arg(ctx: &CmdContext) -> Result<Json, CommandError> {
    let raw = ctx
        .exact_bytes("json")
        .ok_or_else(|| CommandError::msg("missing argument <json>"))?;
    let data = if ctx.values.flag("--base64") {
        let text = std::str::from_utf8(raw)
            .map_err(|_| CommandError::msg("invalid base64 payload"))?;
        BASE64
            .decode(text.trim())
            .map_err(|_| CommandError::msg("invalid base64 payload"))?
    } else {
        raw.to_vec()
    };
    serde_json::from_slice(&data).map_err(|e| CommandError::msg(format!("invalid json: {e}")))
}

/// Emit JSON output as inline data or base64-wrapped, per `--base64`.
fn set_json_response(ctx: &mut CmdContext, data: Json) -> Result<(), CommandError> {
    if ctx.values.flag("--base64") {
        let bytes = serde_json::to_vec(&data)
            .map_err(|e| CommandError::msg(format!("unable to encode json: {e}")))?;
        ctx.set("base64", BASE64.encode(bytes));
    } else {
        ctx.set("data", data);
    }
    Ok(())
}

fn key_match_object(m: &crate::tree::KeyMatch, include_has_value: bool) -> Json {
    let mut obj = serde_json::Map::new();
    obj.insert("key".into(), Json::String(token_path(&m.segments)));
    if !m.metadata.is_empty() {
        obj.insert(
            "metadata".into(),
            Json::Object(
                m.metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), Json::String(v.clone())))
                    .collect(),
            ),
        );
    }
    if include_has_value {
        obj.insert("has_value".into(), Json::Bool(m.has_value));
    }
    obj.insert("has_children".into(), Json::Bool(m.has_children));
    if let Some(value) = &m.value {
        let (escaped, value_type) = value.encode();
        obj.insert("current_value".into(), Json::String(escaped));
        obj.insert("current_type".into(), Json::String(value_type));
    }
    if let Some(rels) = &m.relationships {
        obj.insert(
            "relationships".into(),
            Json::Array(rels.iter().map(|&a| Json::from(a)).collect()),
        );
    }
    Json::Object(obj)
}

// ── Key commands ──────────────────────────────────────────────────────────────

fn fn_set_key(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let (address, exists) = ctx.client.store().set_key(&key).await;
        ctx.set("address", address);
        ctx.set("exists", exists);
        if !exists {
            ctx.mark_dirty(&token_path(&key));
        }
        Ok(())
    })
}

fn fn_set_key_if_exists(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let test = key_arg(ctx, "testkey")?;
        let key = key_arg(ctx, "key")?;
        let (address, exists) = ctx.client.store().set_key_if_exists(&test, &key).await;
        ctx.set("address", address);
        ctx.set("exists", exists);
        if !exists {
            ctx.mark_dirty(&token_path(&key));
        }
        Ok(())
    })
}

fn fn_locate_key(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        if let Some(address) = ctx.client.store().locate_key(&key).await {
            ctx.set("address", address);
        }
        Ok(())
    })
}

fn fn_is_key_indexed(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        if let Some(address) = ctx.client.store().is_key_indexed(&key).await {
            ctx.set("address", address);
        }
        Ok(())
    })
}

fn fn_key_from_address(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let address = int_arg(ctx, "address")? as StoreAddress;
        if let Some(segments) = ctx.client.store().key_from_address(address).await {
            ctx.set("key", token_path(&segments));
        }
        Ok(())
    })
}

fn fn_key_value_from_address(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let address = int_arg(ctx, "address")? as StoreAddress;
        if let Some((segments, value)) =
            ctx.client.store().key_value_from_address(address).await
        {
            ctx.set("key", token_path(&segments));
            if let Some(value) = value {
                add_value_to_response(ctx, &value, "");
            }
        }
        Ok(())
    })
}

fn fn_delete_key(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let (key_removed, value_removed, original) =
            ctx.client.store().delete_key(&key).await;
        ctx.set("key_removed", key_removed);
        if value_removed {
            if let Some(original) = &original {
                add_value_to_response(ctx, original, "original");
            }
            ctx.mark_dirty(&token_path(&key));
        }
        if key_removed {
            ctx.mark_dirty(&token_path(&key));
        }
        Ok(())
    })
}

fn fn_delete_key_with_value(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let clean = ctx.values.flag("--clean");
        let (removed, original) = ctx.client.store().delete_key_with_value(&key, clean).await;
        if removed {
            if let Some(original) = &original {
                add_value_to_response(ctx, original, "original");
            }
            ctx.mark_dirty(&token_path(&key));
        }
        Ok(())
    })
}

fn fn_delete_key_tree(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let removed = ctx.client.store().delete_key_tree(&key).await;
        ctx.set("removed", removed);
        if removed {
            ctx.mark_dirty(&token_path(&key));
        }
        Ok(())
    })
}

fn fn_move_key(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let src = key_arg(ctx, "src")?;
        let dest = key_arg(ctx, "dest")?;
        let overwrite = ctx.values.flag("--overwrite");
        let (exists, moved) = ctx.client.store().move_key(&src, &dest, overwrite).await;
        ctx.set("exists", exists);
        ctx.set("moved", moved);
        ctx.mark_dirty(&token_path(&dest));
        Ok(())
    })
}

fn fn_move_referenced_key(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let src = key_arg(ctx, "src")?;
        let dest = key_arg(ctx, "dest")?;
        let overwrite = ctx.values.flag("--overwrite");
        let expire_ns = expire_arg(&ctx.values);
        let refs: Vec<Vec<String>> = ctx
            .values
            .list("ref")
            .iter()
            .map(|p| parse_token_path(p))
            .collect();
        let unrefs: Vec<Vec<String>> = ctx
            .values
            .list("unref")
            .iter()
            .map(|p| parse_token_path(p))
            .collect();
        let (exists, moved) = ctx
            .client
            .store()
            .move_referenced_key(&src, &dest, overwrite, expire_ns, &refs, &unrefs)
            .await;
        ctx.set("exists", exists);
        ctx.set("moved", moved);
        ctx.mark_dirty(&token_path(&dest));
        Ok(())
    })
}

// ── Value commands ────────────────────────────────────────────────────────────

fn decoded_value_arg(ctx: &CmdContext) -> Result<NativeValue, CommandError> {
    let raw = ctx
        .exact_bytes("value")
        .ok_or_else(|| CommandError::msg("missing argument <value>"))?;
    let value_type = ctx.values.str("type").unwrap_or("");
    Ok(NativeValue::decode(raw, value_type)?)
}

fn fn_set_key_value(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let value = decoded_value_arg(ctx)?;
        let (address, first_value) = ctx.client.store().set_key_value(&key, value).await;
        ctx.set("address", address);
        ctx.set("firstValue", first_value);
        ctx.mark_dirty(&token_path(&key));
        Ok(())
    })
}

async fn set_ex_common(
    ctx: &mut CmdContext,
    value: Option<NativeValue>,
    mut flags: SetExFlags,
) -> Result<(), CommandError> {
    let key = key_arg(ctx, "key")?;

    if ctx.values.flag("--mx") {
        flags.must_exist = true;
    } else if ctx.values.flag("--nx") {
        flags.must_not_exist = true;
    }

    let expire_ns = expire_arg(&ctx.values);

    let relationships = if ctx.values.flag("--relationships") {
        let list = ctx.values.str("relationships").unwrap_or("").trim().to_string();
        if list.is_empty() {
            None
        } else {
            let mut rels = Vec::new();
            for part in list.split(',') {
                let addr: StoreAddress = part
                    .trim()
                    .parse()
                    .map_err(|_| CommandError::msg("invalid relationship address"))?;
                rels.push(addr);
            }
            debug!(?rels, "relationships");
            Some(rels)
        }
    } else {
        None
    };

    let (address, exists, original) = ctx
        .client
        .store()
        .set_key_value_ex(&key, value, flags, expire_ns, relationships)
        .await;
    ctx.set("address", address);
    ctx.set("exists", exists);
    if let Some(original) = &original {
        add_value_to_response(ctx, original, "original");
    }
    ctx.mark_dirty(&token_path(&key));
    Ok(())
}

fn fn_set_ex(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let mut flags = SetExFlags::default();
        let value = if ctx.values.flag("--value") {
            if ctx.values.flag("--nil") {
                return Err(CommandError::msg("--value and --nil are mutually exclusive"));
            }
            Some(decoded_value_arg(ctx)?)
        } else {
            if !ctx.values.flag("--nil") {
                flags.no_value_update = true;
            }
            None
        };
        set_ex_common(ctx, value, flags).await
    })
}

fn fn_set_ex_str(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let value = NativeValue::Str(str_arg(ctx, "value")?.to_string());
        set_ex_common(ctx, Some(value), SetExFlags::default()).await
    })
}

fn fn_set_ex_int(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let value = NativeValue::Int64(int_arg(ctx, "value")?);
        set_ex_common(ctx, Some(value), SetExFlags::default()).await
    })
}

fn fn_get_key_value(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let (value, key_exists, value_exists) = ctx.client.store().get_key_value(&key).await;
        ctx.set("key_exists", key_exists);
        if value_exists {
            if let Some(value) = &value {
                add_value_to_response(ctx, value, "");
            }
        }
        Ok(())
    })
}

fn fn_get_key_value_at_time(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let when = int_arg(ctx, "when")?;
        if let Some(value) = ctx.client.store().get_key_value_at_time(&key, when).await {
            add_value_to_response(ctx, &value, "");
        }
        Ok(())
    })
}

fn fn_calculate_key_value(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let expression = str_arg(ctx, "expression")?.to_string();
        if let Some((address, value)) =
            ctx.client.store().calculate_key_value(&key, &expression).await
        {
            ctx.set("address", address);
            add_value_to_response(ctx, &value, "");
            ctx.mark_dirty(&token_path(&key));
        }
        Ok(())
    })
}

// ── TTL commands ──────────────────────────────────────────────────────────────

fn fn_get_key_ttl(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let ttl = ctx.client.store().get_key_ttl(&key).await;
        if ttl > 0 {
            ctx.set("ttl", ttl.to_string());
        }
        Ok(())
    })
}

fn fn_get_key_value_ttl(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let ttl = ctx.client.store().get_key_value_ttl(&key).await;
        if ttl > 0 {
            ctx.set("ttl", ttl.to_string());
        }
        Ok(())
    })
}

async fn set_ttl_common(ctx: &mut CmdContext, value_ttl: bool, scale: i64) -> Result<(), CommandError> {
    let key = key_arg(ctx, "key")?;
    let ttl = int_arg(ctx, "ttl")?.saturating_mul(scale);
    let exists = if value_ttl {
        ctx.client.store().set_key_value_ttl(&key, ttl).await
    } else {
        ctx.client.store().set_key_ttl(&key, ttl).await
    };
    ctx.set("exists", exists);
    if exists {
        ctx.mark_dirty(&token_path(&key));
    }
    Ok(())
}

fn fn_set_key_ttl_sec(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move { set_ttl_common(ctx, false, NS_PER_SEC).await })
}

fn fn_set_key_ttl_ns(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move { set_ttl_common(ctx, false, 1).await })
}

fn fn_set_key_value_ttl_sec(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move { set_ttl_common(ctx, true, NS_PER_SEC).await })
}

fn fn_set_key_value_ttl_ns(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move { set_ttl_common(ctx, true, 1).await })
}

// ── Metadata commands ─────────────────────────────────────────────────────────

fn fn_set_metadata_attribute(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let attribute = str_arg(ctx, "attribute")?.to_string();
        let value = str_arg(ctx, "value")?.to_string();
        let (key_exists, prior) = ctx
            .client
            .store()
            .set_metadata_attribute(&key, &attribute, &value)
            .await;
        ctx.set("key_exists", key_exists);
        ctx.set("prior_value", prior.unwrap_or_default());
        ctx.mark_dirty(&token_path(&key));
        Ok(())
    })
}

fn fn_get_metadata_attribute(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let attribute = str_arg(ctx, "attribute")?.to_string();
        if let Some(value) = ctx.client.store().get_metadata_attribute(&key, &attribute).await {
            ctx.set("value", value);
        }
        Ok(())
    })
}

fn fn_get_metadata_attributes(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        if let Some(attributes) = ctx.client.store().get_metadata_attributes(&key).await {
            ctx.set(
                "attributes",
                Json::Array(attributes.into_iter().map(Json::String).collect()),
            );
        }
        Ok(())
    })
}

fn fn_clear_metadata_attribute(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let attribute = str_arg(ctx, "attribute")?.to_string();
        let (existed, original) = ctx
            .client
            .store()
            .clear_metadata_attribute(&key, &attribute)
            .await;
        if existed {
            ctx.set("original_value", original.unwrap_or_default());
            ctx.mark_dirty(&token_path(&key));
        }
        Ok(())
    })
}

fn fn_clear_key_metadata(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        ctx.client.store().clear_key_metadata(&key).await;
        ctx.mark_dirty(&token_path(&key));
        Ok(())
    })
}

// ── Enumeration commands ──────────────────────────────────────────────────────

fn fn_list_keys(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let pattern = parse_token_pattern(str_arg(ctx, "pattern")?);
        let (start, limit) = enum_window(&ctx.values);
        let leaves = ctx.values.flag("--leaves");
        let matches = ctx
            .client
            .store()
            .get_matching_keys(&pattern, start, limit, leaves)
            .await;

        if ctx.values.flag("--detailed") {
            let keys: Vec<Json> = matches.iter().map(|m| key_match_object(m, true)).collect();
            ctx.set("keys", Json::Array(keys));
        } else {
            let keypaths: Vec<Json> = matches
                .iter()
                .map(|m| Json::String(token_path(&m.segments)))
                .collect();
            ctx.set("keypaths", Json::Array(keypaths));
        }
        Ok(())
    })
}

fn fn_match_keys(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let pattern_text = str_arg(ctx, "pattern")?.to_string();
        let pattern = parse_token_pattern(&pattern_text);
        let (start, limit) = enum_window(&ctx.values);
        // key paths come back relative to the pattern's fixed prefix
        let prefix_len = pattern
            .iter()
            .take_while(|seg| !seg.is_wildcard())
            .count();
        let matches = ctx
            .client
            .store()
            .get_matching_keys(&pattern, start, limit, false)
            .await;
        let relative: Vec<Json> = matches
            .iter()
            .map(|m| {
                let tail = &m.segments[prefix_len.min(m.segments.len())..];
                let path = tail
                    .iter()
                    .map(|s| crate::escape::escape_segment(s))
                    .collect::<Vec<_>>()
                    .join("/");
                Json::String(path)
            })
            .collect();
        ctx.set("matches", Json::Array(relative));
        Ok(())
    })
}

fn fn_get_level_keys(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let pattern = str_arg(ctx, "pattern")?.to_string();
        let (start, limit) = enum_window(&ctx.values);
        let Some(keys) = ctx
            .client
            .store()
            .get_level_keys(&key, &pattern, start, limit)
            .await
        else {
            return Ok(());
        };

        if ctx.values.flag("--detailed") {
            let detailed: Vec<Json> = keys
                .iter()
                .map(|k| {
                    let mut obj = serde_json::Map::new();
                    obj.insert(
                        "segment".into(),
                        Json::String(crate::escape::escape_segment(&k.segment)),
                    );
                    obj.insert("has_value".into(), Json::Bool(k.has_value));
                    obj.insert("has_children".into(), Json::Bool(k.has_children));
                    Json::Object(obj)
                })
                .collect();
            ctx.set("keys", Json::Array(detailed));
        } else {
            let segments: Vec<Json> = keys
                .iter()
                .map(|k| Json::String(crate::escape::escape_segment(&k.segment)))
                .collect();
            ctx.set("segments", Json::Array(segments));
        }
        Ok(())
    })
}

fn fn_list_key_values(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let pattern = parse_token_pattern(str_arg(ctx, "pattern")?);
        let (start, limit) = enum_window(&ctx.values);
        let matches = ctx
            .client
            .store()
            .get_matching_key_values(&pattern, start, limit)
            .await;

        if ctx.values.flag("--detailed") {
            let values: Vec<Json> = matches.iter().map(|m| key_match_object(m, false)).collect();
            ctx.set("values", Json::Array(values));
        } else {
            let mut data = serde_json::Map::new();
            for m in &matches {
                let escaped = m
                    .value
                    .as_ref()
                    .map(|v| v.encode().0)
                    .unwrap_or_default();
                data.insert(token_path(&m.segments), Json::String(escaped));
            }
            ctx.set("key_values", Json::Object(data));
        }
        Ok(())
    })
}

// ── Relationships ─────────────────────────────────────────────────────────────

fn fn_get_relationship_value(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let index = int_arg(ctx, "index")?.max(0) as usize;
        let (has_link, linked) = ctx.client.store().get_relationship_value(&key, index).await;
        ctx.set("has_link", has_link);
        if let Some((segments, value)) = linked {
            ctx.set("key", token_path(&segments));
            if let Some(value) = &value {
                add_value_to_response(ctx, value, "");
            }
        }
        Ok(())
    })
}

// ── JSON commands ─────────────────────────────────────────────────────────────

fn fn_export(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let data = ctx
            .client
            .store()
            .export(&key)
            .await
            .ok_or_else(|| CommandError::msg("key not found"))?;
        set_json_response(ctx, data)
    })
}

fn fn_import(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let data = json_arg(ctx)?;
        ctx.client
            .store()
            .import(&key, &data)
            .await
            .map_err(CommandError::msg)?;
        ctx.mark_dirty(&token_path(&key));
        Ok(())
    })
}

fn fn_get_key_json(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let data = ctx
            .client
            .store()
            .get_key_as_json(&key, json_opts(&ctx.values))
            .await
            .ok_or_else(|| CommandError::msg("key not found"))?;
        set_json_response(ctx, data)
    })
}

fn fn_set_key_json(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let data = json_arg(ctx)?;
        let (replaced, address) = ctx
            .client
            .store()
            .set_key_json(&key, &data, json_opts(&ctx.values))
            .await;
        ctx.set("replaced", replaced);
        ctx.set("address", address);
        ctx.mark_dirty(&token_path(&key));
        Ok(())
    })
}

fn fn_create_key_json(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let data = json_arg(ctx)?;
        if let Some(address) = ctx
            .client
            .store()
            .create_key_json(&key, &data, json_opts(&ctx.values))
            .await
        {
            ctx.set("address", address);
        }
        ctx.mark_dirty(&token_path(&key));
        Ok(())
    })
}

fn fn_replace_key_json(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let data = json_arg(ctx)?;
        if let Some(address) = ctx
            .client
            .store()
            .replace_key_json(&key, &data, json_opts(&ctx.values))
            .await
        {
            ctx.set("address", address);
        }
        ctx.mark_dirty(&token_path(&key));
        Ok(())
    })
}

fn fn_merge_key_json(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let data = json_arg(ctx)?;
        let address = ctx
            .client
            .store()
            .merge_key_json(&key, &data, json_opts(&ctx.values))
            .await;
        ctx.set("address", address);
        ctx.mark_dirty(&token_path(&key));
        Ok(())
    })
}

fn fn_stage_key_json(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let data = json_arg(ctx)?;
        let (temp, address) = ctx
            .client
            .store()
            .stage_key_json(&data, json_opts(&ctx.values))
            .await;
        ctx.set("tempkey", token_path(&temp));
        ctx.set("address", address);
        ctx.mark_dirty(&token_path(&temp));
        Ok(())
    })
}

// ── Admin commands ────────────────────────────────────────────────────────────

fn fn_purge(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        if !ctx.values.flag("--destructive") {
            return Err(CommandError::msg("--destructive required"));
        }
        ctx.store_set.discard_all();
        // every client re-selects so nobody keeps a detached store
        for cs in ctx.clients.snapshot() {
            cs.select_db(&cs.selected_db());
        }
        ctx.mark_dirty("/");
        Ok(())
    })
}

fn fn_define_auto_link(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let data_key = str_arg(ctx, "datakey")?.to_string();
        let link_key = str_arg(ctx, "linkkey")?.to_string();
        let fields: Vec<String> = str_arg(ctx, "fields")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let defined = ctx
            .client
            .store()
            .define_auto_link(&data_key, &link_key, fields)
            .await;
        ctx.set("defined", defined);
        ctx.mark_dirty(&link_key);
        Ok(())
    })
}

fn fn_remove_auto_link(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let link_key = str_arg(ctx, "linkkey")?.to_string();
        let removed = ctx.client.store().remove_auto_link(&link_key).await;
        ctx.set("removed", removed);
        if removed {
            ctx.mark_dirty(&link_key);
        }
        Ok(())
    })
}

fn fn_get_auto_link(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let link_key = str_arg(ctx, "linkkey")?.to_string();
        if let Some((data_key, fields)) =
            ctx.client.store().get_auto_link_definition(&link_key).await
        {
            ctx.set("datakey", data_key);
            ctx.set(
                "fields",
                Json::Array(fields.into_iter().map(Json::String).collect()),
            );
        }
        Ok(())
    })
}

fn fn_help(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let entries: Vec<Json> = ctx
            .help
            .iter()
            .map(|entry| {
                let mut obj = serde_json::Map::new();
                obj.insert("command".into(), Json::String(entry.command.clone()));
                obj.insert("help".into(), Json::String(entry.help.clone()));
                if !entry.options.is_empty() {
                    obj.insert(
                        "options".into(),
                        Json::Array(
                            entry.options.iter().cloned().map(Json::String).collect(),
                        ),
                    );
                }
                Json::Object(obj)
            })
            .collect();
        ctx.set("help", Json::Array(entries));
        Ok(())
    })
}

fn fn_use_db(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let name = str_arg(ctx, "name")?.to_string();
        let prior = ctx
            .client
            .select_db(&name)
            .ok_or_else(|| CommandError::msg(format!("cannot select store '{name}'")))?;
        ctx.set("prior", prior);
        Ok(())
    })
}

fn fn_clients(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let filter: HashMap<String, String> = ctx
            .values
            .str("addr")
            .map(|addr| HashMap::from([("addr".to_string(), addr.to_string())]))
            .unwrap_or_default();
        let mut list = Vec::new();
        for cs in ctx.clients.snapshot() {
            match cs.link() {
                Some(link) if !link.matches_filter(&filter) => continue,
                // an address filter cannot match a socketless client
                None if !filter.is_empty() => continue,
                _ => {}
            }
            let mut obj = serde_json::Map::new();
            obj.insert("id".into(), Json::from(cs.id));
            obj.insert("user".into(), Json::String(cs.user().to_string()));
            obj.insert("db".into(), Json::String(cs.selected_db()));
            obj.insert("resp".into(), Json::from(cs.resp_version()));
            obj.insert("blocked".into(), Json::Bool(cs.is_blocked().await));
            if let Some(link) = cs.link() {
                obj.insert(
                    "info".into(),
                    Json::Array(
                        link.client_info().into_iter().map(Json::String).collect(),
                    ),
                );
            }
            list.push(Json::Object(obj));
        }
        ctx.set("clients", Json::Array(list));
        Ok(())
    })
}

fn fn_unblock(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let id = int_arg(ctx, "id")?.max(0) as u64;
        let reason = ctx
            .values
            .str("reason")
            .unwrap_or("unblocked")
            .to_string();
        match ctx.clients.get(id) {
            Some(target) => {
                target.unblock(&reason, true).await;
                ctx.set("found", true);
            }
            None => ctx.set("found", false),
        }
        Ok(())
    })
}

fn fn_wait_value(ctx: &mut CmdContext) -> HandlerFuture<'_> {
    Box::pin(async move {
        let key = key_arg(ctx, "key")?;
        let key_path = token_path(&key);
        let db = ctx.client.selected_db();
        let timeout = if ctx.values.flag("--sec") {
            Duration::from_secs(int_arg(ctx, "sec")?.max(0) as u64)
        } else {
            // effectively unbounded; an unblock or shutdown ends it
            Duration::from_secs(86400 * 365)
        };

        let client = Arc::clone(&ctx.client);
        let mut events = ctx.store_set.subscribe();
        let mut rx = client.capture().await;
        let timer = tokio::time::sleep(timeout);
        tokio::pin!(timer);

        let outcome = loop {
            tokio::select! {
                notice = rx.recv() => {
                    break WaitOutcome::Unblocked(notice.unwrap_or(
                        crate::client::UnblockReason { reason: String::new(), is_error: false },
                    ));
                }
                _ = &mut timer => {
                    break WaitOutcome::TimedOut;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) if event.store == db && event.key == key_path => {
                            client.set_watch_version(&db, &key_path, event.version);
                            break WaitOutcome::DataReady;
                        }
                        _ => {} // another key, or a lagged receiver
                    }
                }
            }
        };
        drop(rx);
        client.release_capture().await;

        match outcome {
            WaitOutcome::Unblocked(notice) if notice.is_error => {
                Err(CommandError::msg(notice.reason))
            }
            WaitOutcome::Unblocked(_) | WaitOutcome::TimedOut => {
                ctx.set("timed_out", true);
                Ok(())
            }
            WaitOutcome::DataReady => {
                let (value, key_exists, value_exists) =
                    ctx.client.store().get_key_value(&key).await;
                ctx.set("key_exists", key_exists);
                if value_exists {
                    if let Some(value) = &value {
                        add_value_to_response(ctx, value, "");
                    }
                }
                Ok(())
            }
        }
    })
}

enum WaitOutcome {
    Unblocked(crate::client::UnblockReason),
    TimedOut,
    DataReady,
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Register the full command set. Option spec strings follow the
/// primary spec grammar; `*` marks a repeatable option.
pub fn register_all(registry: &mut CommandRegistry) {
    let ttl_opts: [(&str, &str); 2] = [
        ("[--sec <int-sec>]", "expiration in seconds; negative is relative to now"),
        ("[--ns <int-ns>]", "expiration in nanoseconds; negative is relative to now"),
    ];
    let window_opts: [(&str, &str); 2] = [
        ("[--start <int-start>]", "index of the first match to return"),
        ("[--limit <int-limit>]", "maximum number of matches to return"),
    ];

    // keys
    registry.register_write_command(
        "setk <string-key>",
        "Ensures a key exists, creating it if needed",
        &[],
        fn_set_key,
    );
    registry.register_write_command(
        "setkif <string-testkey> <string-key>",
        "Sets a key only when the test key exists",
        &[],
        fn_set_key_if_exists,
    );
    registry.register_write_command(
        "delk <string-key>",
        "Deletes a childless key",
        &[],
        fn_delete_key,
    );
    registry.register_write_command(
        "delv <string-key>",
        "Removes a key's value",
        &[("[--clean]", "also remove the key and empty ancestors")],
        fn_delete_key_with_value,
    );
    registry.register_write_command(
        "deltree <string-key>",
        "Deletes a key and its entire subtree",
        &[],
        fn_delete_key_tree,
    );
    registry.register_command(
        "getk <string-key>",
        "Looks up a key's address",
        &[],
        fn_locate_key,
    );
    registry.register_command(
        "indexed <string-key>",
        "Reports the address of an explicitly created key",
        &[],
        fn_is_key_indexed,
    );
    registry.register_command(
        "addrk <int-address>",
        "Resolves an address to its key path",
        &[],
        fn_key_from_address,
    );
    registry.register_write_command(
        "mv <string-src> <string-dest>",
        "Moves a key subtree",
        &[("[--overwrite]", "replace the destination if it exists")],
        fn_move_key,
    );
    {
        let mut opts: Vec<(&str, &str)> = vec![
            ("[--overwrite]", "replace the destination if it exists"),
            ("[--ref <string-ref>]*", "keys that gain a relationship to the destination"),
            ("[--unref <string-unref>]*", "keys that drop their relationship to the destination"),
        ];
        opts.extend_from_slice(&ttl_opts);
        registry.register_write_command(
            "mvref <string-src> <string-dest>",
            "Moves a key and updates referencing keys",
            &opts,
            fn_move_referenced_key,
        );
    }

    // values
    registry.register_write_command(
        "setv <string-key> <string-value>",
        "Sets a key's value",
        &[("[--value-type <string-type>]", "value type tag; empty means raw bytes")],
        fn_set_key_value,
    );
    {
        let mut opts: Vec<(&str, &str)> = vec![
            ("[--value <string-value>]", "the value to store"),
            ("[--nil]", "store an empty value"),
            ("[--value-type <string-type>]", "value type tag; empty means raw bytes"),
            ("[--mx]", "only when the key already exists"),
            ("[--nx]", "only when the key does not exist"),
            ("[--relationships <string-relationships>]", "comma separated addresses to link"),
        ];
        opts.extend_from_slice(&ttl_opts);
        registry.register_write_command(
            "setex <string-key>",
            "Sets a key value with preconditions, expiration and relationships",
            &opts,
            fn_set_ex,
        );
    }
    {
        let mut opts: Vec<(&str, &str)> = vec![
            ("[--mx]", "only when the key already exists"),
            ("[--nx]", "only when the key does not exist"),
            ("[--relationships <string-relationships>]", "comma separated addresses to link"),
        ];
        opts.extend_from_slice(&ttl_opts);
        registry.register_write_command(
            "setstr <string-key> <string-value>",
            "Sets a string value",
            &opts,
            fn_set_ex_str,
        );
        registry.register_write_command(
            "setint <string-key> <int-value>",
            "Sets an integer value",
            &opts,
            fn_set_ex_int,
        );
    }
    registry.register_command(
        "getv <string-key>",
        "Reads a key's current value",
        &[],
        fn_get_key_value,
    );
    registry.register_command(
        "vat <string-key> <int-when>",
        "Reads a key's value as of a Unix nanosecond timestamp; negative is relative to now",
        &[],
        fn_get_key_value_at_time,
    );
    registry.register_command(
        "addrv <int-address>",
        "Resolves an address to its key and value",
        &[],
        fn_key_value_from_address,
    );
    registry.register_write_command(
        "calc <string-key> <string-expression>",
        "Computes and stores a value; 'v' names the current value",
        &[],
        fn_calculate_key_value,
    );

    // ttl
    registry.register_command(
        "ttlk <string-key>",
        "Reads a key's expiration timestamp",
        &[],
        fn_get_key_ttl,
    );
    registry.register_command(
        "ttlv <string-key>",
        "Reads a value's expiration timestamp",
        &[],
        fn_get_key_value_ttl,
    );
    registry.register_write_command(
        "expirek <string-key> <int-ttl>",
        "Sets a key's expiration in seconds; negative is relative to now",
        &[],
        fn_set_key_ttl_sec,
    );
    registry.register_write_command(
        "expirekns <string-key> <int-ttl>",
        "Sets a key's expiration in nanoseconds; negative is relative to now",
        &[],
        fn_set_key_ttl_ns,
    );
    registry.register_write_command(
        "expirev <string-key> <int-ttl>",
        "Sets a value's expiration in seconds; negative is relative to now",
        &[],
        fn_set_key_value_ttl_sec,
    );
    registry.register_write_command(
        "expirevns <string-key> <int-ttl>",
        "Sets a value's expiration in nanoseconds; negative is relative to now",
        &[],
        fn_set_key_value_ttl_ns,
    );

    // metadata
    registry.register_write_command(
        "setmeta <string-key> <string-attribute> <string-value>",
        "Sets a metadata attribute on a key",
        &[],
        fn_set_metadata_attribute,
    );
    registry.register_command(
        "getmeta <string-key> <string-attribute>",
        "Reads a metadata attribute",
        &[],
        fn_get_metadata_attribute,
    );
    registry.register_command(
        "lsmeta <string-key>",
        "Lists a key's metadata attribute names",
        &[],
        fn_get_metadata_attributes,
    );
    registry.register_write_command(
        "delmeta <string-key> <string-attribute>",
        "Removes a metadata attribute",
        &[],
        fn_clear_metadata_attribute,
    );
    registry.register_write_command(
        "resetmeta <string-key>",
        "Removes all metadata from a key",
        &[],
        fn_clear_key_metadata,
    );

    // enumeration
    {
        let mut opts: Vec<(&str, &str)> = window_opts.to_vec();
        opts.push(("[--leaves]", "only keys without children"));
        opts.push(("[--detailed]", "full match records instead of paths"));
        registry.register_command(
            "lsk <string-pattern>",
            "Lists keys matching a pattern",
            &opts,
            fn_list_keys,
        );
    }
    registry.register_command(
        "keys <string-pattern>",
        "Lists matching keys relative to the pattern's fixed prefix",
        &window_opts,
        fn_match_keys,
    );
    {
        let mut opts: Vec<(&str, &str)> = window_opts.to_vec();
        opts.push(("[--detailed]", "segment records instead of names"));
        registry.register_command(
            "nodes <string-key> <string-pattern>",
            "Lists one level of child segments under a key",
            &opts,
            fn_get_level_keys,
        );
    }
    {
        let mut opts: Vec<(&str, &str)> = window_opts.to_vec();
        opts.push(("[--detailed]", "full match records instead of a path map"));
        registry.register_command(
            "lsv <string-pattern>",
            "Lists values of keys matching a pattern",
            &opts,
            fn_list_key_values,
        );
    }

    // relationships
    registry.register_command(
        "follow <string-key> <int-index>",
        "Follows a key's relationship by index",
        &[],
        fn_get_relationship_value,
    );

    // json
    let b64_opt: (&str, &str) = ("[--base64]", "base64-wrap the JSON payload");
    let straskey_opt: (&str, &str) =
        ("[--straskey]", "map JSON string values to child keys");
    registry.register_command(
        "export <string-key>",
        "Exports a subtree as a self-describing JSON snapshot",
        &[b64_opt],
        fn_export,
    );
    registry.register_write_command(
        "import <string-key> <string-json>",
        "Imports a snapshot, replacing the subtree",
        &[b64_opt],
        fn_import,
    );
    registry.register_command(
        "getjson <string-key>",
        "Reads a subtree as JSON",
        &[b64_opt, straskey_opt],
        fn_get_key_json,
    );
    registry.register_write_command(
        "setjson <string-key> <string-json>",
        "Replaces a subtree with a JSON structure",
        &[b64_opt, straskey_opt],
        fn_set_key_json,
    );
    registry.register_write_command(
        "createjson <string-key> <string-json>",
        "Writes a JSON structure only when the key does not exist",
        &[b64_opt, straskey_opt],
        fn_create_key_json,
    );
    registry.register_write_command(
        "replacejson <string-key> <string-json>",
        "Writes a JSON structure only when the key exists",
        &[b64_opt, straskey_opt],
        fn_replace_key_json,
    );
    registry.register_write_command(
        "mergejson <string-key> <string-json>",
        "Deep-merges a JSON structure into a subtree",
        &[b64_opt, straskey_opt],
        fn_merge_key_json,
    );
    registry.register_write_command(
        "stagejson <string-json>",
        "Writes a JSON structure under a unique staging key",
        &[b64_opt, straskey_opt],
        fn_stage_key_json,
    );

    // admin
    registry.register_write_command(
        "purge",
        "Discards every store and reseeds an empty main store",
        &[("[--destructive]", "required confirmation")],
        fn_purge,
    );
    registry.register_write_command(
        "autolink <string-datakey> <string-linkkey> <string-fields>",
        "Defines an auto-link from a data key to a link key",
        &[],
        fn_define_auto_link,
    );
    registry.register_write_command(
        "rmautolink <string-linkkey>",
        "Removes an auto-link definition",
        &[],
        fn_remove_auto_link,
    );
    registry.register_command(
        "getautolink <string-linkkey>",
        "Reads an auto-link definition",
        &[],
        fn_get_auto_link,
    );
    registry.register_command("help", "Lists every command", &[], fn_help);

    // session and blocking
    registry.register_command(
        "use <string-name>",
        "Selects the client's current store, creating it on demand",
        &[],
        fn_use_db,
    );
    registry.register_command(
        "clients",
        "Lists connected clients",
        &[("[--addr <string-addr>]", "only the client at this remote address")],
        fn_clients,
    );
    registry.register_command(
        "unblock <int-id>",
        "Cancels another client's blocking command",
        &[("[--reason <string-reason>]", "text delivered to the blocked command")],
        fn_unblock,
    );
    registry.register_command(
        "waitv <string-key>",
        "Blocks until the key's value changes, a timeout lapses, or an unblock arrives",
        &[("[--sec <int-sec>]", "timeout in seconds")],
        fn_wait_value,
    );
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientRegistry, ClientState};
    use crate::dispatch::CmdDispatcher;
    use crate::frame::RawRequest;
    use crate::store_set::StoreSet;

    async fn setup() -> (Arc<CmdDispatcher>, Arc<ClientState>) {
        let store_set = StoreSet::new(None, 1).await.unwrap();
        let clients = Arc::new(ClientRegistry::new());
        let cs = clients.register(Arc::clone(&store_set), None);
        (Arc::new(CmdDispatcher::new(store_set, clients, None)), cs)
    }

    fn req(tokens: &[&str]) -> RawRequest {
        RawRequest::from_tokens(tokens.iter().map(|t| t.as_bytes()))
    }

    async fn run(
        disp: &CmdDispatcher,
        cs: &Arc<ClientState>,
        tokens: &[&str],
    ) -> serde_json::Value {
        let out = disp.dispatch(cs, req(tokens)).await.unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[tokio::test]
    async fn setk_then_getk_share_an_address() {
        let (disp, cs) = setup().await;
        let set = run(&disp, &cs, &["setk", "/a/b"]).await;
        assert_eq!(set["exists"], false);
        let get = run(&disp, &cs, &["getk", "/a/b"]).await;
        assert_eq!(get["address"], set["address"]);
    }

    #[tokio::test]
    async fn binary_value_round_trip() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setv", "/k", "\\00"]).await;
        let get = run(&disp, &cs, &["getv", "/k"]).await;
        assert_eq!(get["key_exists"], true);
        assert_eq!(get["value"], "\\00");
        assert_eq!(get["type"], "");
    }

    #[tokio::test]
    async fn typed_value_keeps_its_tag() {
        let (disp, cs) = setup().await;
        // int16 517 = 0x0205
        run(&disp, &cs, &["setv", "/n", "\\02\\05", "--value-type", "int16"]).await;
        let get = run(&disp, &cs, &["getv", "/n"]).await;
        assert_eq!(get["type"], "int16");
        assert_eq!(get["value"], "\\02\\05");
    }

    #[tokio::test]
    async fn path_escaped_key_round_trips() {
        let (disp, cs) = setup().await;
        // key literally "a/b": path-escaped to a\sb on the wire
        run(&disp, &cs, &["setk", "a\\sb"]).await;
        let ls = run(&disp, &cs, &["lsk", "/*"]).await;
        let keypaths = ls["keypaths"].as_array().unwrap();
        assert_eq!(keypaths.len(), 1);
        assert_eq!(keypaths[0], "/a\\sb");
    }

    #[tokio::test]
    async fn setex_nx_does_not_overwrite() {
        let (disp, cs) = setup().await;
        let first = run(
            &disp,
            &cs,
            &["setex", "/x", "--value", "hello", "--value-type", "string", "--nx"],
        )
        .await;
        assert_eq!(first["exists"], false);
        let second = run(
            &disp,
            &cs,
            &["setex", "/x", "--value", "other", "--value-type", "string", "--nx"],
        )
        .await;
        assert_eq!(second["exists"], true);
        let get = run(&disp, &cs, &["getv", "/x"]).await;
        assert_eq!(get["value"], "hello");
    }

    #[tokio::test]
    async fn setex_value_and_nil_conflict() {
        let (disp, cs) = setup().await;
        let out = run(&disp, &cs, &["setex", "/x", "--value", "v", "--nil"]).await;
        assert_eq!(out["error"], "--value and --nil are mutually exclusive");
    }

    #[tokio::test]
    async fn expired_value_reports_key_without_value() {
        let (disp, cs) = setup().await;
        // an absolute expiration in the past: value is born expired
        run(
            &disp,
            &cs,
            &["setex", "/x", "--value", "hello", "--value-type", "string", "--ns", "1"],
        )
        .await;
        let get = run(&disp, &cs, &["getv", "/x"]).await;
        assert_eq!(get["key_exists"], true);
        assert!(get.get("value").is_none());
    }

    #[tokio::test]
    async fn ttl_fields_appear_only_when_set() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setk", "/t"]).await;
        let before = run(&disp, &cs, &["ttlk", "/t"]).await;
        assert!(before.get("ttl").is_none());
        // relative one hour
        let out = run(&disp, &cs, &["expirek", "/t", "-3600"]).await;
        assert_eq!(out["exists"], true);
        let after = run(&disp, &cs, &["ttlk", "/t"]).await;
        assert!(after["ttl"].as_str().unwrap().parse::<i64>().unwrap() > 0);
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setk", "/m"]).await;
        let set = run(&disp, &cs, &["setmeta", "/m", "color", "red"]).await;
        assert_eq!(set["key_exists"], true);
        assert_eq!(set["prior_value"], "");
        let get = run(&disp, &cs, &["getmeta", "/m", "color"]).await;
        assert_eq!(get["value"], "red");
        let ls = run(&disp, &cs, &["lsmeta", "/m"]).await;
        assert_eq!(ls["attributes"], serde_json::json!(["color"]));
        let del = run(&disp, &cs, &["delmeta", "/m", "color"]).await;
        assert_eq!(del["original_value"], "red");
    }

    #[tokio::test]
    async fn keys_are_relative_to_fixed_prefix() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setk", "/client/test/key"]).await;
        run(&disp, &cs, &["setk", "/client/test/data/cat"]).await;
        run(&disp, &cs, &["setk", "/client/test/data/mouse"]).await;
        let out = run(&disp, &cs, &["keys", "/client/**"]).await;
        assert_eq!(
            out["matches"],
            serde_json::json!(["test/data/cat", "test/data/mouse", "test/key"])
        );
    }

    #[tokio::test]
    async fn lsk_detailed_includes_value_fields() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setv", "/d/k", "payload", "--value-type", "string"]).await;
        let out = run(&disp, &cs, &["lsk", "/d/*", "--detailed"]).await;
        let keys = out["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0]["key"], "/d/k");
        assert_eq!(keys[0]["has_value"], true);
        assert_eq!(keys[0]["current_value"], "payload");
        assert_eq!(keys[0]["current_type"], "string");
    }

    #[tokio::test]
    async fn nodes_lists_level_segments() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setk", "/p/one"]).await;
        run(&disp, &cs, &["setk", "/p/two/deep"]).await;
        let out = run(&disp, &cs, &["nodes", "/p", "*"]).await;
        assert_eq!(out["segments"], serde_json::json!(["one", "two"]));
        let detailed = run(&disp, &cs, &["nodes", "/p", "*", "--detailed"]).await;
        let keys = detailed["keys"].as_array().unwrap();
        assert_eq!(keys[1]["segment"], "two");
        assert_eq!(keys[1]["has_children"], true);
    }

    #[tokio::test]
    async fn lsv_maps_paths_to_values() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setv", "/v/a", "1", "--value-type", "string"]).await;
        run(&disp, &cs, &["setk", "/v/bare"]).await;
        let out = run(&disp, &cs, &["lsv", "/v/*"]).await;
        assert_eq!(out["key_values"], serde_json::json!({"/v/a": "1"}));
    }

    #[tokio::test]
    async fn follow_traverses_relationships() {
        let (disp, cs) = setup().await;
        let target = run(&disp, &cs, &["setv", "/target", "t", "--value-type", "string"]).await;
        let addr = target["address"].as_u64().unwrap();
        run(
            &disp,
            &cs,
            &["setex", "/from", "--relationships", &addr.to_string()],
        )
        .await;
        let out = run(&disp, &cs, &["follow", "/from", "0"]).await;
        assert_eq!(out["has_link"], true);
        assert_eq!(out["key"], "/target");
        assert_eq!(out["value"], "t");
        let missing = run(&disp, &cs, &["follow", "/from", "5"]).await;
        assert_eq!(missing["has_link"], false);
    }

    #[tokio::test]
    async fn json_round_trip_with_base64() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setjson", "/j", r#"{"a":1,"b":"x"}"#]).await;
        let plain = run(&disp, &cs, &["getjson", "/j"]).await;
        assert_eq!(plain["data"], serde_json::json!({"a":1,"b":"x"}));
        let wrapped = run(&disp, &cs, &["getjson", "/j", "--base64"]).await;
        let decoded = BASE64
            .decode(wrapped["base64"].as_str().unwrap())
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(parsed, serde_json::json!({"a":1,"b":"x"}));
    }

    #[tokio::test]
    async fn export_import_between_keys() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setv", "/src/k", "data", "--value-type", "string"]).await;
        let exported = run(&disp, &cs, &["export", "/src"]).await;
        let payload = serde_json::to_string(&exported["data"]).unwrap();
        run(&disp, &cs, &["import", "/copy", &payload]).await;
        let get = run(&disp, &cs, &["getv", "/copy/k"]).await;
        assert_eq!(get["value"], "data");
    }

    #[tokio::test]
    async fn purge_requires_destructive() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setk", "/doomed"]).await;
        let refused = run(&disp, &cs, &["purge"]).await;
        assert_eq!(refused["error"], "--destructive required");
        run(&disp, &cs, &["purge", "--destructive"]).await;
        let after = run(&disp, &cs, &["getk", "/doomed"]).await;
        assert!(after.get("address").is_none());
    }

    #[tokio::test]
    async fn use_switches_stores() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setk", "/only-in-main"]).await;
        let out = run(&disp, &cs, &["use", "scratch"]).await;
        assert_eq!(out["prior"], "main");
        let miss = run(&disp, &cs, &["getk", "/only-in-main"]).await;
        assert!(miss.get("address").is_none());
        let back = run(&disp, &cs, &["use", "main"]).await;
        assert_eq!(back["prior"], "scratch");
        let hit = run(&disp, &cs, &["getk", "/only-in-main"]).await;
        assert!(hit.get("address").is_some());
    }

    #[tokio::test]
    async fn calc_computes_from_current_value() {
        let (disp, cs) = setup().await;
        run(&disp, &cs, &["setint", "/n", "10"]).await;
        let out = run(&disp, &cs, &["calc", "/n", "v*2"]).await;
        assert_eq!(out["type"], "int64");
        let bad = run(&disp, &cs, &["calc", "/n", "nonsense("]).await;
        assert!(bad.get("address").is_none());
    }

    #[tokio::test]
    async fn autolink_lifecycle() {
        let (disp, cs) = setup().await;
        let defined = run(&disp, &cs, &["autolink", "/data", "/index", "id,name"]).await;
        assert_eq!(defined["defined"], true);
        let get = run(&disp, &cs, &["getautolink", "/index"]).await;
        assert_eq!(get["datakey"], "/data");
        assert_eq!(get["fields"], serde_json::json!(["id", "name"]));
        let removed = run(&disp, &cs, &["rmautolink", "/index"]).await;
        assert_eq!(removed["removed"], true);
        let gone = run(&disp, &cs, &["getautolink", "/index"]).await;
        assert!(gone.get("datakey").is_none());
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let (disp, cs) = setup().await;
        let out = run(&disp, &cs, &["help"]).await;
        let entries = out["help"].as_array().unwrap();
        assert!(entries.len() > 30);
        assert!(entries
            .iter()
            .any(|e| e["command"].as_str().unwrap().starts_with("setk ")));
    }

    #[tokio::test]
    async fn clients_lists_registered_sessions() {
        let (disp, cs) = setup().await;
        let out = run(&disp, &cs, &["clients"]).await;
        let clients = out["clients"].as_array().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["id"], cs.id);
        assert_eq!(clients[0]["blocked"], false);
    }

    #[tokio::test]
    async fn waitv_unblock_surfaces_error_and_connection_recovers() {
        let (disp, cs) = setup().await;
        let waiter = {
            let disp = Arc::clone(&disp);
            let cs = Arc::clone(&cs);
            tokio::spawn(async move {
                disp.dispatch(&cs, req(&["waitv", "/blocked"])).await.unwrap()
            })
        };
        // give the waiter time to capture
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cs.is_blocked().await);

        let admin = run(&disp, &cs, &["unblock", &cs.id.to_string(), "--reason", "admin says stop"]).await;
        assert_eq!(admin["found"], true);

        let out = waiter.await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["error"], "admin says stop");

        // the next command on the same client dispatches normally
        let next = run(&disp, &cs, &["setk", "/after"]).await;
        assert_eq!(next["exists"], false);
    }

    #[tokio::test]
    async fn waitv_data_ready_returns_the_value() {
        let (disp, cs) = setup().await;
        let waiter = {
            let disp = Arc::clone(&disp);
            let cs = Arc::clone(&cs);
            tokio::spawn(async move {
                disp.dispatch(&cs, req(&["waitv", "/hot", "--sec", "10"])).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let store_set = Arc::clone(&disp.store_set);
        let clients = Arc::clone(&disp.clients);
        let other = clients.register(store_set, None);
        run(&disp, &other, &["setv", "/hot", "ready", "--value-type", "string"]).await;

        let out = waiter.await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["key_exists"], true);
        assert_eq!(v["value"], "ready");
    }

    #[tokio::test]
    async fn waitv_times_out() {
        let (disp, cs) = setup().await;
        let out = run(&disp, &cs, &["waitv", "/never", "--sec", "0"]).await;
        assert_eq!(out["timed_out"], true);
    }
}
