//! Browser tests; run with `wasm-pack test --headless --chrome`.

use idbscope_wasm::{is_supported, WebSession};
use js_sys::{Promise, Reflect};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

/// Resolves once an event of `kind` is delivered to the session listener.
fn next_event(session: &WebSession, kind: &'static str) -> JsFuture {
    let promise = Promise::new(&mut |resolve, _reject| {
        let listener = Closure::<dyn FnMut(JsValue)>::new(move |event: JsValue| {
            let seen = Reflect::get(&event, &"kind".into()).unwrap();
            if seen.as_string().as_deref() == Some(kind) {
                resolve.call1(&JsValue::NULL, &event).unwrap();
            }
        });
        session.on_event(listener.as_ref().unchecked_ref::<js_sys::Function>().clone());
        listener.forget();
    });
    JsFuture::from(promise)
}

#[wasm_bindgen_test]
fn indexeddb_is_available() {
    assert!(is_supported());
}

#[wasm_bindgen_test]
async fn open_runs_the_migration() {
    let session = WebSession::new(vec!["line-items".into()], None).unwrap();
    let opened = next_event(&session, "success");
    session.open("idbscope-open-test".into(), 1).unwrap();
    opened.await.unwrap();

    assert_eq!(session.state(), "open");
    assert_eq!(session.collections(), vec!["line-items".to_string()]);

    let deleted = next_event(&session, "success");
    session.delete("idbscope-open-test".into()).unwrap();
    deleted.await.unwrap();
    assert_eq!(session.state(), "closed");
}

#[wasm_bindgen_test]
async fn put_is_visible_after_commit() {
    let session = WebSession::new(vec!["line-items".into()], None).unwrap();
    let opened = next_event(&session, "success");
    session.open("idbscope-put-test".into(), 1).unwrap();
    opened.await.unwrap();

    session
        .put(serde_wasm_bindgen::to_value(&serde_json::json!({"id": "a1", "qty": 2})).unwrap())
        .unwrap();

    // Projection refreshes after the commit; poll the snapshot.
    let mut projection = JsValue::UNDEFINED;
    for _ in 0..50 {
        let snapshot = session.snapshot().unwrap();
        projection = Reflect::get(&snapshot, &"projection".into()).unwrap();
        if js_sys::Array::from(&projection).length() == 1 {
            break;
        }
        let tick = Promise::new(&mut |resolve, _| {
            web_sys::window()
                .unwrap()
                .set_timeout_with_callback_and_timeout_and_arguments_0(&resolve, 10)
                .unwrap();
        });
        JsFuture::from(tick).await.unwrap();
    }
    let first = js_sys::Array::from(&projection).get(0);
    assert_eq!(Reflect::get(&first, &"id".into()).unwrap(), "a1");

    let deleted = next_event(&session, "success");
    session.delete("idbscope-put-test".into()).unwrap();
    deleted.await.unwrap();
}
