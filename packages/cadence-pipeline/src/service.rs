//! Shopping-list REST service expressed as a five-stage pipeline:
//! route, validate, fetch, expand, render.

use crate::context::{CancelToken, Context, Method, Responder};
use crate::error::PipelineError;
use crate::pipeline::{RequestPipeline, Stage, Step};
use crate::response::Response;
use crate::store::{Datastore, Filter, MemoryStore, StoreConfig, StoreError};
use cadence_scheduler::{AsyncOperation, EventLoop};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};
use std::cell::Cell;
use std::rc::Rc;

pub const LISTS: &str = "shopping_list";
pub const ITEMS: &str = "item";
pub const LIST_ITEMS: &str = "shopping_list_item";
pub const BRANDS: &str = "brand";

/// A store with the collections the service reads and writes.
pub fn shopping_store(config: StoreConfig) -> MemoryStore {
    MemoryStore::new(config)
        .with_collection(LISTS)
        .with_collection(ITEMS)
        .with_collection(LIST_ITEMS)
        .with_collection(BRANDS)
}

/// Resource a request path resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Lists,
    List,
    ListItems,
    ListItem,
    Items,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Lists => "lists",
            Route::List => "list",
            Route::ListItems => "list_items",
            Route::ListItem => "list_item",
            Route::Items => "items",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemQuery {
    Description(String),
    Upc(String),
    Id(u64),
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListAll,
    CreateList {
        description: String,
    },
    ReadList {
        id: u64,
    },
    UpdateList {
        id: u64,
        description: String,
    },
    ListItems {
        list_id: u64,
    },
    AddItem {
        list_id: u64,
        item_id: u64,
        quantity: u64,
    },
    UpdateItem {
        list_id: u64,
        item_id: u64,
        quantity: u64,
        picked_up: bool,
    },
    RemoveItem {
        list_id: u64,
        item_id: u64,
    },
    SearchItems(ItemQuery),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ListAll => "list_all",
            Command::CreateList { .. } => "create_list",
            Command::ReadList { .. } => "read_list",
            Command::UpdateList { .. } => "update_list",
            Command::ListItems { .. } => "list_items",
            Command::AddItem { .. } => "add_item",
            Command::UpdateItem { .. } => "update_item",
            Command::RemoveItem { .. } => "remove_item",
            Command::SearchItems(_) => "search_items",
        }
    }
}

// Routing

pub struct RouteStage;

impl RouteStage {
    fn resolve(segments: &[String]) -> Result<Route, PipelineError> {
        let parts: Vec<&str> = segments.iter().map(String::as_str).collect();
        match parts.as_slice() {
            ["lists"] => Ok(Route::Lists),
            ["lists", _] => Ok(Route::List),
            ["lists", _, "items"] => Ok(Route::ListItems),
            ["lists", _, "items", _] => Ok(Route::ListItem),
            ["lists", _, other, ..] => Err(PipelineError::validation(format!(
                "unknown list resource `{other}`"
            ))),
            ["items"] => Ok(Route::Items),
            ["items", ..] => Err(PipelineError::validation("items are searched with a query")),
            _ => Err(PipelineError::not_found(format!("no route for /{}", parts.join("/")))),
        }
    }

    fn allows(route: Route, method: &Method) -> bool {
        matches!(
            (route, method),
            (Route::Lists, Method::Get | Method::Post)
                | (Route::List, Method::Get | Method::Put)
                | (Route::ListItems, Method::Get | Method::Post)
                | (Route::ListItem, Method::Put | Method::Delete)
                | (Route::Items, Method::Get)
        )
    }
}

impl Stage for RouteStage {
    fn name(&self) -> &'static str {
        "route"
    }

    fn run(&self, _lp: &EventLoop, cx: &mut Context, _input: Value) -> Result<Step, PipelineError> {
        let route = Self::resolve(&cx.segments)?;
        if !Self::allows(route, &cx.method) {
            return Err(PipelineError::validation(format!(
                "{} is not supported on {}",
                cx.method, cx.path
            )));
        }
        Ok(Step::Continue(json!({ "route": route.as_str() })))
    }
}

// Validation

pub struct ValidateStage;

fn parse_id(raw: Option<&String>, what: &str) -> Result<u64, PipelineError> {
    raw.and_then(|raw| raw.parse::<u64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| PipelineError::validation(format!("malformed {what} id")))
}

fn body_object(cx: &Context) -> Result<&Map<String, Value>, PipelineError> {
    cx.body
        .as_ref()
        .and_then(Value::as_object)
        .ok_or_else(|| PipelineError::validation("request body must be a JSON object"))
}

fn description(fields: &Map<String, Value>) -> Result<String, PipelineError> {
    fields
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::validation("`description` must be a non-empty string"))
}

fn quantity(fields: &Map<String, Value>) -> Result<u64, PipelineError> {
    match fields.get("quantity") {
        None | Some(Value::Null) => Ok(1),
        Some(value) => value
            .as_u64()
            .filter(|quantity| *quantity > 0)
            .ok_or_else(|| PipelineError::validation("`quantity` must be a positive integer")),
    }
}

fn picked_up(fields: &Map<String, Value>) -> Result<bool, PipelineError> {
    match fields.get("pickedUp") {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(value) => match value.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(PipelineError::validation("`pickedUp` must be a boolean, 0 or 1")),
        },
    }
}

impl ValidateStage {
    fn command(route: Route, cx: &Context) -> Result<Command, PipelineError> {
        let list_id = || parse_id(cx.segments.get(1), "list");
        let item_id = || parse_id(cx.segments.get(3), "item");

        let command = match (route, &cx.method) {
            (Route::Lists, Method::Get) => Command::ListAll,
            (Route::Lists, _) => Command::CreateList {
                description: description(body_object(cx)?)?,
            },
            (Route::List, Method::Get) => Command::ReadList { id: list_id()? },
            (Route::List, _) => Command::UpdateList {
                id: list_id()?,
                description: description(body_object(cx)?)?,
            },
            (Route::ListItems, Method::Get) => Command::ListItems {
                list_id: list_id()?,
            },
            (Route::ListItems, _) => {
                let list_id = list_id()?;
                let fields = body_object(cx)?;
                let item_id = fields
                    .get("itemId")
                    .and_then(Value::as_u64)
                    .filter(|id| *id > 0)
                    .ok_or_else(|| PipelineError::validation("`itemId` must be a positive integer"))?;
                Command::AddItem {
                    list_id,
                    item_id,
                    quantity: quantity(fields)?,
                }
            }
            (Route::ListItem, Method::Delete) => Command::RemoveItem {
                list_id: list_id()?,
                item_id: item_id()?,
            },
            (Route::ListItem, _) => {
                let (list_id, item_id) = (list_id()?, item_id()?);
                // An absent body means "reset to defaults".
                let empty = Map::new();
                let fields = match &cx.body {
                    None => &empty,
                    Some(_) => body_object(cx)?,
                };
                Command::UpdateItem {
                    list_id,
                    item_id,
                    quantity: quantity(fields)?,
                    picked_up: picked_up(fields)?,
                }
            }
            (Route::Items, _) => Command::SearchItems(Self::item_query(cx)?),
        };
        Ok(command)
    }

    fn item_query(cx: &Context) -> Result<ItemQuery, PipelineError> {
        let param = |name: &str| cx.query.get(name).filter(|value| !value.is_empty());
        if let Some(text) = param("description") {
            Ok(ItemQuery::Description(text.clone()))
        } else if let Some(upc) = param("upc") {
            Ok(ItemQuery::Upc(upc.clone()))
        } else if let Some(raw) = param("id") {
            Ok(ItemQuery::Id(parse_id(Some(raw), "item")?))
        } else {
            Err(PipelineError::validation(
                "item search needs one of `description`, `upc` or `id`",
            ))
        }
    }
}

impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn run(&self, _lp: &EventLoop, cx: &mut Context, _input: Value) -> Result<Step, PipelineError> {
        let route = match cx.output("route").and_then(|out| out["route"].as_str()) {
            Some("lists") => Route::Lists,
            Some("list") => Route::List,
            Some("list_items") => Route::ListItems,
            Some("list_item") => Route::ListItem,
            Some("items") => Route::Items,
            _ => return Err(PipelineError::Internal("request was not routed".into())),
        };
        let command = Self::command(route, cx)?;
        tracing::debug!(request = cx.id, command = command.name(), "request validated");
        let output = json!({ "command": command.name() });
        cx.command = Some(command);
        Ok(Step::Continue(output))
    }
}

// Data access

/// Adapts a store call to the pipeline's value and error types.
fn lift<T, F>(
    lp: &EventLoop,
    operation: AsyncOperation<T, StoreError>,
    f: F,
) -> AsyncOperation<Value, PipelineError>
where
    T: Clone + 'static,
    F: FnOnce(T) -> Value + 'static,
{
    operation.map_result(lp, move |outcome| outcome.map(f).map_err(PipelineError::from))
}

fn current_command(cx: &Context) -> Result<Command, PipelineError> {
    cx.command
        .clone()
        .ok_or_else(|| PipelineError::Internal("request was not validated".into()))
}

pub struct FetchStage {
    store: Rc<dyn Datastore>,
}

impl Stage for FetchStage {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn run(&self, lp: &EventLoop, cx: &mut Context, _input: Value) -> Result<Step, PipelineError> {
        let store = &self.store;
        let operation = match current_command(cx)? {
            Command::ListAll => lift(lp, store.find_many(lp, LISTS, Filter::All), |v| v),
            Command::CreateList { description } => lift(
                lp,
                store.create(lp, LISTS, json!({ "description": description })),
                Value::from,
            ),
            Command::ReadList { id } | Command::ListItems { list_id: id } => {
                lift(lp, store.find(lp, LISTS, id), |v| v)
            }
            Command::UpdateList { id, description } => lift(
                lp,
                store.update(lp, LISTS, id, json!({ "description": description })),
                Value::from,
            ),
            Command::AddItem {
                list_id,
                item_id,
                quantity,
            } => lift(
                lp,
                store.create(
                    lp,
                    LIST_ITEMS,
                    json!({
                        "shopping_list_id": list_id,
                        "item_id": item_id,
                        "quantity": quantity,
                        "picked_up": false,
                    }),
                ),
                Value::from,
            ),
            Command::UpdateItem {
                list_id,
                item_id,
                quantity,
                picked_up,
            } => lift(
                lp,
                store.update_where(
                    lp,
                    LIST_ITEMS,
                    list_item_filter(list_id, item_id),
                    json!({ "quantity": quantity, "picked_up": picked_up }),
                ),
                Value::from,
            ),
            Command::RemoveItem { list_id, item_id } => lift(
                lp,
                store.remove_where(lp, LIST_ITEMS, list_item_filter(list_id, item_id)),
                Value::from,
            ),
            Command::SearchItems(ItemQuery::Description(text)) => lift(
                lp,
                store.find_many(lp, ITEMS, Filter::contains("description", text)),
                |v| v,
            ),
            Command::SearchItems(ItemQuery::Upc(upc)) => {
                lift(lp, store.find_many(lp, ITEMS, Filter::eq("upc", upc)), |v| v)
            }
            Command::SearchItems(ItemQuery::Id(id)) => lift(lp, store.find(lp, ITEMS, id), |v| v),
        };
        Ok(Step::Await(operation))
    }
}

fn list_item_filter(list_id: u64, item_id: u64) -> Filter {
    Filter::eq("shopping_list_id", list_id).and("item_id", item_id)
}

// Joins

fn into_records(value: Value) -> Vec<Value> {
    match value {
        Value::Array(records) => records,
        Value::Null => Vec::new(),
        record => vec![record],
    }
}

/// Distinct ids referenced through `field`, ascending.
fn referenced_ids(records: &[Value], field: &str) -> Vec<u64> {
    let mut ids: Vec<u64> = records
        .iter()
        .filter_map(|record| record.get(field).and_then(Value::as_u64))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

fn index_by_id(records: Vec<Value>) -> FxHashMap<u64, Value> {
    records
        .into_iter()
        .filter_map(|record| Some((record.get("id")?.as_u64()?, record)))
        .collect()
}

/// Stores the record that `records[i][field]` points at under `key`, or
/// null when there is none.
fn attach(
    records: Vec<Value>,
    field: &str,
    key: &str,
    targets: &FxHashMap<u64, Value>,
) -> Vec<Value> {
    records
        .into_iter()
        .map(|mut record| {
            let target = record
                .get(field)
                .and_then(Value::as_u64)
                .and_then(|id| targets.get(&id).cloned())
                .unwrap_or(Value::Null);
            if let Value::Object(fields) = &mut record {
                fields.insert(key.to_string(), target);
            }
            record
        })
        .collect()
}

/// Items with their brand record under `"brand"`.
fn with_brands(
    lp: &EventLoop,
    store: &Rc<dyn Datastore>,
    items: Vec<Value>,
) -> AsyncOperation<Vec<Value>, StoreError> {
    let ids = referenced_ids(&items, "brand_id");
    store
        .find_many(lp, BRANDS, Filter::any_of("id", ids))
        .map(lp, move |brands| {
            attach(items, "brand_id", "brand", &index_by_id(into_records(brands)))
        })
}

/// List entries with their item, and the item's brand, under `"item"`.
fn with_items(
    lp: &EventLoop,
    store: Rc<dyn Datastore>,
    entries: Vec<Value>,
) -> AsyncOperation<Vec<Value>, StoreError> {
    let ids = referenced_ids(&entries, "item_id");
    store
        .find_many(lp, ITEMS, Filter::any_of("id", ids))
        .and_then(lp, move |lp, items| with_brands(lp, &store, into_records(items)))
        .map(lp, move |items| attach(entries, "item_id", "item", &index_by_id(items)))
}

/// Resolves what fetched records refer to: the entries of a list with
/// their items, or the brands of found items.
pub struct ExpandStage {
    store: Rc<dyn Datastore>,
}

impl Stage for ExpandStage {
    fn name(&self) -> &'static str {
        "expand"
    }

    fn run(&self, lp: &EventLoop, cx: &mut Context, input: Value) -> Result<Step, PipelineError> {
        match current_command(cx)? {
            Command::ListItems { list_id } => {
                let store = self.store.clone();
                let entries = self
                    .store
                    .find_many(lp, LIST_ITEMS, Filter::eq("shopping_list_id", list_id))
                    .and_then(lp, move |lp, entries| with_items(lp, store, into_records(entries)));
                Ok(Step::Await(lift(lp, entries, Value::Array)))
            }
            Command::SearchItems(query) => {
                let single = matches!(query, ItemQuery::Id(_));
                let items = with_brands(lp, &self.store, into_records(input));
                Ok(Step::Await(lift(lp, items, move |items| {
                    if single {
                        items.into_iter().next().unwrap_or(Value::Null)
                    } else {
                        Value::Array(items)
                    }
                })))
            }
            _ => Ok(Step::Continue(input)),
        }
    }
}

// Response shaping

pub struct RenderStage;

impl Stage for RenderStage {
    fn name(&self) -> &'static str {
        "render"
    }

    fn run(&self, _lp: &EventLoop, cx: &mut Context, input: Value) -> Result<Step, PipelineError> {
        let response = match current_command(cx)? {
            Command::CreateList { .. } | Command::AddItem { .. } => {
                Response::created(json!({ "createdId": input }))
            }
            Command::UpdateList { .. } | Command::UpdateItem { .. } | Command::RemoveItem { .. } => {
                Response::ok(json!({ "rowsAffected": input }))
            }
            Command::ListItems { .. } => {
                let mut list = cx.output("fetch").cloned().unwrap_or_else(|| json!({}));
                if let Value::Object(fields) = &mut list {
                    fields.insert("items".into(), input);
                }
                Response::ok(list)
            }
            Command::SearchItems(ItemQuery::Description(text)) => match input {
                Value::Array(found) if found.is_empty() => {
                    return Err(PipelineError::not_found(format!("no item matches `{text}`")));
                }
                found => Response::ok(found),
            },
            Command::SearchItems(ItemQuery::Upc(upc)) => match input {
                Value::Array(mut found) if !found.is_empty() => Response::ok(found.swap_remove(0)),
                _ => return Err(PipelineError::not_found(format!("no item with upc `{upc}`"))),
            },
            Command::ListAll | Command::ReadList { .. } | Command::SearchItems(ItemQuery::Id(_)) => {
                Response::ok(input)
            }
        };
        Ok(Step::Respond(response))
    }
}

/// The transport-facing entry point.
pub struct ShoppingService {
    pipeline: RequestPipeline,
    next_request: Cell<u64>,
}

impl ShoppingService {
    pub fn new(store: impl Datastore + 'static) -> Self {
        let store: Rc<dyn Datastore> = Rc::new(store);
        let pipeline = RequestPipeline::new()
            .stage(RouteStage)
            .stage(ValidateStage)
            .stage(FetchStage {
                store: store.clone(),
            })
            .stage(ExpandStage { store })
            .stage(RenderStage);
        Self {
            pipeline,
            next_request: Cell::new(1),
        }
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Builds a context for one request and starts it. Stage 0 runs before
    /// this returns; the response arrives later through `responder`.
    pub fn dispatch<F>(
        &self,
        lp: &EventLoop,
        method: &str,
        target: &str,
        body: Option<Value>,
        responder: F,
    ) -> CancelToken
    where
        F: FnOnce(&EventLoop, Response) + 'static,
    {
        let id = self.next_request.get();
        self.next_request.set(id + 1);

        let cx = Context::new(id, Method::parse(method), target, body, Responder::new(responder));
        let token = cx.cancel_token();
        self.pipeline.run(lp, cx);
        token
    }
}
