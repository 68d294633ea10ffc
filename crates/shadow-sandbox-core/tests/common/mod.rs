#![allow(dead_code)]
//! Shared fixtures for the core integration tests.
//!
//! The fixture platform has three types:
//!
//! - `platform.os.Build`: static `MODEL` set by its static initializer
//! - `platform.view.View`: base view with an `attached` flag
//! - `platform.widget.TextView`: a `View` holding `text`

use anyhow::anyhow;
use parking_lot::Mutex;
use shadow_sandbox_core::{
    ClassDef, ClassPath, Configuration, DispatchTable, OverrideCatalog, OverrideDef, Sandbox,
};
use shadow_sandbox_types::Value;
use std::sync::Arc;

pub const BUILD: &str = "platform.os.Build";
pub const VIEW: &str = "platform.view.View";
pub const TEXT_VIEW: &str = "platform.widget.TextView";

/// Serializes tests that touch process-wide registries.
pub static GLOBAL_STATE: Mutex<()> = Mutex::new(());

pub fn class_path() -> Arc<ClassPath> {
    let build = ClassDef::new(BUILD)
        .static_initializer(|ctx, _| {
            ctx.set_static(BUILD, "MODEL", Value::str("generic"))?;
            Ok(Value::Unit)
        })
        .static_method("getModel()", "string", |ctx, _| ctx.get_static(BUILD, "MODEL"))
        .unwrap()
        .static_method("setModel(string)", "void", |ctx, args| {
            ctx.set_static(BUILD, "MODEL", args[0].clone())?;
            Ok(Value::Unit)
        })
        .unwrap();

    let view = ClassDef::new(VIEW)
        .constructor("", |ctx, _| {
            ctx.this()?.set_field("attached", Value::Bool(false));
            Ok(Value::Unit)
        })
        .unwrap()
        .method("isAttached()", "boolean", |ctx, _| Ok(ctx.this()?.get_field("attached")))
        .unwrap();

    let text_view = ClassDef::new(TEXT_VIEW)
        .with_superclass(VIEW)
        .constructor("string", |ctx, args| {
            ctx.this()?.set_field("text", args[0].clone());
            Ok(Value::Unit)
        })
        .unwrap()
        .method("getText()", "string", |ctx, _| Ok(ctx.this()?.get_field("text")))
        .unwrap()
        .method("setText(string)", "void", |ctx, args| {
            ctx.this()?.set_field("text", args[0].clone());
            Ok(Value::Unit)
        })
        .unwrap()
        .method("setText(any)", "void", |ctx, args| {
            let rendered = match &args[0] {
                Value::Str(s) => s.clone(),
                Value::Int(i) => i.to_string(),
                other => return Err(anyhow!("cannot render {}", other.kind())),
            };
            ctx.this()?.set_field("text", Value::str(rendered));
            Ok(Value::Unit)
        })
        .unwrap()
        .method("length()", "int", |ctx, _| {
            let text = ctx.this()?.get_field("text");
            Ok(Value::Int(text.as_str().map_or(0, |s| s.chars().count()) as i64))
        })
        .unwrap();

    Arc::new(
        ClassPath::new()
            .with_class(build)
            .unwrap()
            .with_class(view)
            .unwrap()
            .with_class(text_view)
            .unwrap(),
    )
}

pub fn configuration() -> Arc<Configuration> {
    Arc::new(
        Configuration::builder()
            .instrument_package("platform")
            .build()
            .unwrap(),
    )
}

pub fn sandbox(table: DispatchTable) -> Sandbox {
    Sandbox::builder(class_path(), configuration())
        .with_sdk(30)
        .with_dispatch_table(table)
        .build()
        .unwrap()
}

pub fn text_view_override(name: &str, text: &'static str) -> OverrideDef {
    OverrideDef::new(name, TEXT_VIEW)
        .member("getText()", move |_, _| Ok(Value::str(text)))
        .unwrap()
}

pub fn catalog() -> Arc<OverrideCatalog> {
    let mut catalog = OverrideCatalog::new();
    catalog.register(text_view_override("ClassTextView", "class"));
    catalog.register(text_view_override("MethodTextView", "method"));
    catalog.register(
        OverrideDef::new("ShadowBuild", BUILD)
            .static_member("getModel()", |_, _| Ok(Value::str("shadow")))
            .unwrap(),
    );
    Arc::new(catalog)
}
