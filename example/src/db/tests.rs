// Tenon
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Common tests for any database implementation.

use crate::db::KVStore;
use crate::model::*;
use tenon_core::db::DbError;

pub(crate) async fn test_sequence_one<C: KVStore>(mut context: C) {
    let key = Key::new("the-key".to_owned());

    context.begin().await.unwrap();

    assert_eq!(DbError::NotFound, context.get_key(&key).await.unwrap_err());
    assert_eq!(None, context.get_key_version(&key).await.unwrap());

    let entry = Entry::new("insert".to_owned(), Version::initial());
    context.set_key(&key, &entry).await.unwrap();
    assert_eq!(entry, context.get_key(&key).await.unwrap());
    assert_eq!(Some(entry.version()), context.get_key_version(&key).await.unwrap().as_ref());

    let entry = Entry::new("upsert".to_owned(), Version::from_i32(5).unwrap());
    context.set_key(&key, &entry).await.unwrap();
    assert_eq!(entry, context.get_key(&key).await.unwrap());
    assert_eq!(Some(entry.version()), context.get_key_version(&key).await.unwrap().as_ref());

    context.delete_key(&key).await.unwrap();

    assert_eq!(DbError::NotFound, context.get_key(&key).await.unwrap_err());
    assert_eq!(None, context.get_key_version(&key).await.unwrap());

    context.commit().await.unwrap();
    context.close().await;
}

pub(crate) async fn test_multiple_keys<C: KVStore>(mut context: C) {
    let key1 = Key::new("key 1".to_owned());
    let key2 = Key::new("key 2".to_owned());
    let entry = Entry::new("same value".to_owned(), Version::from_i32(123).unwrap());

    context.begin().await.unwrap();

    assert_eq!(DbError::NotFound, context.get_key(&key1).await.unwrap_err());
    assert_eq!(DbError::NotFound, context.get_key(&key2).await.unwrap_err());

    context.set_key(&key1, &entry).await.unwrap();

    assert_eq!(entry, context.get_key(&key1).await.unwrap());
    assert_eq!(DbError::NotFound, context.get_key(&key2).await.unwrap_err());

    assert_eq!(DbError::NotFound, context.delete_key(&key2).await.unwrap_err());

    context.set_key(&key2, &entry).await.unwrap();

    assert_eq!(entry, context.get_key(&key1).await.unwrap());
    assert_eq!(entry, context.get_key(&key2).await.unwrap());
    assert_eq!(
        vec![key1, key2],
        context.get_keys().await.unwrap().into_iter().collect::<Vec<Key>>()
    );

    context.commit().await.unwrap();
    context.close().await;
}

pub(crate) async fn test_rollback_discards_changes<C: KVStore>(mut context: C) {
    let key = Key::new("the-key".to_owned());
    let entry = Entry::new("committed".to_owned(), Version::initial());
    context.set_key(&key, &entry).await.unwrap();

    context.begin().await.unwrap();
    context.delete_key(&key).await.unwrap();
    context
        .set_key(&Key::new("other".to_owned()), &Entry::new("x".to_owned(), Version::initial()))
        .await
        .unwrap();
    context.rollback().await.unwrap();

    assert_eq!(entry, context.get_key(&key).await.unwrap());
    assert_eq!(1, context.get_keys().await.unwrap().len());
    context.close().await;
}

#[macro_export]
macro_rules! generate_db_tests [
    ( $setup:expr $(, #[$extra:meta])? ) => {
        tenon_core::db::testutils::generate_tests!(
            $( #[$extra], )?
            $setup,
            $crate::db::tests,
            test_sequence_one,
            test_multiple_keys,
            test_rollback_discards_changes
        );
    }
];

pub(crate) use generate_db_tests;
