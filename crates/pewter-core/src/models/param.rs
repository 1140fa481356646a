//! Param definition lifecycle.

use crate::models::SideFx;
use pewter_schema::Param;

pub(crate) fn validate(param: &mut Param) -> SideFx {
    let v = &mut param.validation;
    if param.name.is_empty() {
        v.error("name is required");
    }
    if !param.schema.is_null() && !param.schema.is_object() {
        v.error("schema must be an object");
    }
    v.set_valid();
    v.set_useable();
    v.set_available();
    SideFx::default()
}
