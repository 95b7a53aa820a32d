//! Resume entity handlers: thin CRUD mappers over the store.
//!
//! Every handler here is deliberately plain: extract params, call one store
//! method, shape the row into JSON. All cross-cutting behavior (auth,
//! caching, invalidation, watermarking) happens in the dispatch runtime.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::dispatch::registry::{handler, ToolRegistry};
use crate::errors::AppError;
use crate::llm_client::LlmClient;
use crate::store::{EntityKind, EntityRow, Store};

use super::{require_object, require_uuid};

struct EntityMethods {
    kind: EntityKind,
    resource: &'static str,
    list: &'static str,
    create: &'static str,
    update: Option<&'static str>,
    delete: Option<&'static str>,
}

const ENTITIES: &[EntityMethods] = &[
    EntityMethods {
        kind: EntityKind::Experience,
        resource: "experience",
        list: "list_experience",
        create: "create_experience",
        update: Some("update_experience"),
        delete: Some("delete_experience"),
    },
    EntityMethods {
        kind: EntityKind::Skill,
        resource: "skills",
        list: "list_skills",
        create: "create_skill",
        update: None,
        delete: Some("delete_skill"),
    },
    EntityMethods {
        kind: EntityKind::Project,
        resource: "projects",
        list: "list_projects",
        create: "create_project",
        update: Some("update_project"),
        delete: Some("delete_project"),
    },
    EntityMethods {
        kind: EntityKind::Education,
        resource: "education",
        list: "list_education",
        create: "create_education",
        update: None,
        delete: None,
    },
    EntityMethods {
        kind: EntityKind::Certification,
        resource: "certifications",
        list: "list_certifications",
        create: "create_certification",
        update: None,
        delete: None,
    },
];

pub fn register(registry: &mut ToolRegistry, store: Store) -> Result<(), AppError> {
    {
        let store = store.clone();
        registry.register(
            "get_profile",
            &["profile:read"],
            handler(move |_params, call| {
                let store = store.clone();
                async move {
                    let user_id = call.require_user()?;
                    let profile = store
                        .get_profile(user_id)
                        .await?
                        .ok_or_else(|| AppError::NotFound("profile".into()))?;
                    Ok(json!({ "profile": profile.data, "updated_at": profile.updated_at }))
                }
            }),
        )?;
    }

    {
        let store = store.clone();
        registry.register(
            "update_profile",
            &["profile:write"],
            handler(move |params, call| {
                let store = store.clone();
                async move {
                    let user_id = call.require_user()?;
                    let data = require_object(&params, "data")?;
                    store.upsert_profile(user_id, &data).await?;
                    Ok(json!({ "updated": true }))
                }
            }),
        )?;
    }

    for entity in ENTITIES {
        register_entity(registry, store.clone(), entity)?;
    }

    Ok(())
}

fn register_entity(
    registry: &mut ToolRegistry,
    store: Store,
    entity: &EntityMethods,
) -> Result<(), AppError> {
    let kind = entity.kind;
    let resource = entity.resource;
    let read_perm = format!("{resource}:read");
    let write_perm = format!("{resource}:write");

    {
        let store = store.clone();
        registry.register(
            entity.list,
            &[read_perm.as_str()],
            handler(move |_params, call| {
                let store = store.clone();
                async move {
                    let user_id = call.require_user()?;
                    let rows = store.list_entities(kind, user_id).await?;
                    Ok(json!({ "entries": rows.iter().map(row_json).collect::<Vec<_>>() }))
                }
            }),
        )?;
    }

    {
        let store = store.clone();
        registry.register(
            entity.create,
            &[write_perm.as_str()],
            handler(move |params, call| {
                let store = store.clone();
                async move {
                    let user_id = call.require_user()?;
                    let data = require_object(&params, "data")?;
                    let row = store.insert_entity(kind, user_id, &data).await?;
                    Ok(row_json(&row))
                }
            }),
        )?;
    }

    if let Some(update) = entity.update {
        let store = store.clone();
        registry.register(
            update,
            &[write_perm.as_str()],
            handler(move |params, call| {
                let store = store.clone();
                async move {
                    let user_id = call.require_user()?;
                    let id = require_uuid(&params, "id")?;
                    let data = require_object(&params, "data")?;
                    let row = store.update_entity(kind, user_id, id, &data).await?;
                    Ok(row_json(&row))
                }
            }),
        )?;
    }

    if let Some(delete) = entity.delete {
        let store = store.clone();
        registry.register(
            delete,
            &[write_perm.as_str()],
            handler(move |params, call| {
                let store = store.clone();
                async move {
                    let user_id = call.require_user()?;
                    let id = require_uuid(&params, "id")?;
                    store.delete_entity(kind, user_id, id).await?;
                    Ok(json!({ "deleted": true }))
                }
            }),
        )?;
    }

    Ok(())
}

fn row_json(row: &EntityRow) -> Value {
    json!({
        "id": row.id,
        "data": row.data,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
    })
}

const SUMMARY_SYSTEM_PROMPT: &str = "You are a resume assistant. Write a concise professional \
summary (3-5 sentences) from the structured resume data provided. Return plain text only.";

/// Builds a plain-text summary of the whole resume via the LLM.
pub async fn summarize(store: &Store, llm: &LlmClient, user_id: Uuid) -> Result<Value, AppError> {
    let profile = store.get_profile(user_id).await?.map(|p| p.data);
    let experience = store.list_entities(EntityKind::Experience, user_id).await?;
    let skills = store.list_entities(EntityKind::Skill, user_id).await?;
    let projects = store.list_entities(EntityKind::Project, user_id).await?;

    let prompt = json!({
        "profile": profile,
        "experience": experience.iter().map(|r| &r.data).collect::<Vec<_>>(),
        "skills": skills.iter().map(|r| &r.data).collect::<Vec<_>>(),
        "projects": projects.iter().map(|r| &r.data).collect::<Vec<_>>(),
    })
    .to_string();

    let completion = llm.generate(&prompt, SUMMARY_SYSTEM_PROMPT).await?;
    Ok(json!({
        "summary": completion.text,
        "model": completion.model,
        "usage": completion.usage,
    }))
}
