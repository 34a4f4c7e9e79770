use docflow::{
    bson::{Bson, doc},
    memory::InMemoryStore,
    prelude::*,
};

#[tokio::test]
async fn test_committed_work_becomes_visible() {
    let store = DocumentStore::new(InMemoryStore::new());
    let outside = store.clone();

    let inserted = store
        .transact(|tx| async move {
            let ctx = ExecutionContext::system();
            let result = tx.collection("accounts").insert_one(doc! { "_id": 1, "balance": 10 }, &ctx).await?;

            assert_eq!(tx.collection("accounts").count(doc! {}, &ctx).await?, 1);
            assert_eq!(outside.collection("accounts").count(doc! {}, &ctx).await?, 0);

            Ok(result.inserted_id)
        })
        .await
        .unwrap();

    assert_eq!(inserted, Bson::Int32(1));
    assert_eq!(
        store.collection("accounts").count(doc! {}, &ExecutionContext::system()).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_failed_work_is_rolled_back() {
    let store = DocumentStore::new(InMemoryStore::new());
    let ctx = ExecutionContext::system();
    let accounts = store.collection("accounts");
    accounts.insert_one(doc! { "_id": 1, "balance": 10 }, &ctx).await.unwrap();

    let err = store
        .transact(|tx| async move {
            let ctx = ExecutionContext::system();
            let accounts = tx.collection("accounts");
            accounts
                .update_one(doc! { "_id": 1 }, doc! { "$inc": { "balance": -10 } }, &ctx)
                .await?;
            accounts.insert_one(doc! { "_id": 1 }, &ctx).await?;

            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DocumentStoreError::DocumentAlreadyExists(_, _)));
    assert_eq!(
        accounts.find_one(doc! { "_id": 1 }, &ctx).await.unwrap(),
        Some(doc! { "_id": 1, "balance": 10 })
    );
}

#[tokio::test]
async fn test_bound_collections_keep_behaviors() {
    let store = DocumentStore::new(InMemoryStore::new());
    let ctx = ExecutionContext::for_user("u1");
    let posts = store
        .collection_builder("posts")
        .behavior(SoftDelete::default())
        .build()
        .await
        .unwrap();
    posts.insert_one(doc! { "_id": 1 }, &ctx).await.unwrap();

    let bound = posts.clone();
    store
        .transact(|tx| async move {
            let posts = bound.bind(&tx);
            let ctx = ExecutionContext::for_user("u1");

            posts.delete_one(doc! { "_id": 1 }, &ctx).await
        })
        .await
        .unwrap();

    assert_eq!(posts.count(doc! {}, &ctx).await.unwrap(), 0);
    assert_eq!(posts.count(doc! { "isDeleted": true }, &ctx).await.unwrap(), 1);
}
