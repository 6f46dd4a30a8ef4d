use super::schema::{merkle_roots, merkle_tree_data};
use diesel::prelude::*;

#[derive(Insertable)]
#[diesel(table_name = merkle_roots)]
pub struct NewRoot<'a> {
    pub root_hash: &'a str,
    pub item_count: i64,
    pub source_path: &'a str,
}

#[derive(Insertable)]
#[diesel(table_name = merkle_tree_data)]
pub struct NewTreeData<'a> {
    pub root_id: i32,
    pub tree_json: &'a serde_json::Value,
}
