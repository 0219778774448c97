//! Traits which need to be implemented for federated data types

use crate::{config::Data, error::Error};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::ops::Deref;
use url::Url;

/// Helper for converting between database structs and federated protocol structs.
///
/// ```
/// # use url::Url;
/// # use fediverse_federation_core::protocol::public_key::PublicKey;
/// # use fediverse_federation_core::config::Data;
/// # use fediverse_federation_core::traits::Object;
/// # use fediverse_federation_core::traits::tests::{DbConnection, Person};
/// # pub struct DbUser {
/// #     pub name: String,
/// #     pub ap_id: Url,
/// #     pub inbox: Url,
/// #     pub public_key: String,
/// # }
///
/// #[async_trait::async_trait]
/// impl Object for DbUser {
///     type DataType = DbConnection;
///     type Kind = Person;
///     type Error = anyhow::Error;
///
/// async fn read_from_id(object_id: Url, data: &Data<Self::DataType>) -> Result<Option<Self>, Self::Error> {
///         // Attempt to read object from local database. Return Ok(None) if not found.
///         let user: Option<DbUser> = data.read_user_from_apub_id(object_id).await?;
///         Ok(user)
///     }
///
/// async fn into_json(self, data: &Data<Self::DataType>) -> Result<Self::Kind, Self::Error> {
///         // Called when a local object gets sent out over Activitypub. Simply convert it to the
///         // protocol struct
///         Ok(Person {
///             kind: Default::default(),
///             preferred_username: self.name,
///             id: self.ap_id.clone().into(),
///             inbox: self.inbox,
///             public_key: PublicKey::new(self.ap_id, self.public_key),
///         })
///     }
///
/// async fn verify(json: &Self::Kind, expected_domain: &Url, data: &Data<Self::DataType>) -> Result<(), Self::Error> {
///         Ok(())
///     }
///
/// async fn from_json(json: Self::Kind, data: &Data<Self::DataType>) -> Result<Self, Self::Error> {
///         // Called when a remote object gets received over Activitypub. Validate and insert it
///         // into the database.
///
///         let user = DbUser {
///             name: json.preferred_username,
///             ap_id: json.id.into_inner(),
///             inbox: json.inbox,
///             public_key: json.public_key.public_key_pem,
///         };
///
///         // Make sure not to overwrite any local object
///         if data.domain() == user.ap_id.domain().unwrap() {
///             // Activitypub doesnt distinguish between creating and updating an object. Thats why we
///             // need to use upsert functionality here
///             data.upsert(&user).await?;
///         }
///         Ok(user)
///     }
///
/// }
/// ```
#[async_trait]
pub trait Object: Sized {
    /// App data type passed to handlers. Must be identical to
    /// [crate::config::FederationConfigBuilder::app_data] type.
    type DataType: Clone + Send + Sync;
    /// The type of protocol struct which gets sent over network to federate this database struct.
    type Kind;
    /// Error type returned by handler methods
    type Error;

    /// Returns the last time this object was updated.
    ///
    /// Used to avoid refetching an object over HTTP every time it is dereferenced. Only called
    /// for remote objects.
    fn last_refreshed_at(&self) -> Option<NaiveDateTime> {
        None
    }

    /// Try to read the object with given `id` from local database.
    ///
    /// Should return `Ok(None)` if not found.
    async fn read_from_id(
        object_id: Url,
        data: &Data<Self::DataType>,
    ) -> Result<Option<Self>, Self::Error>;

    /// Mark remote object as deleted in local database.
    ///
    /// Called when a `Delete` activity is received, or if fetch returns a `Tombstone` object.
    async fn delete(self, _data: &Data<Self::DataType>) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Convert database type to Activitypub type.
    ///
    /// Called when a local object gets fetched by another instance over HTTP, or when an object
    /// gets sent in an activity.
    async fn into_json(self, data: &Data<Self::DataType>) -> Result<Self::Kind, Self::Error>;

    /// Verifies that the given wire object is valid for the given `expected_domain`.
    ///
    /// Must be called before [Object::from_json], separately from it so that callers which only
    /// need to verify (without writing to the database) can do so, for example the inbox
    /// signature verification path.
    async fn verify(
        json: &Self::Kind,
        expected_domain: &Url,
        data: &Data<Self::DataType>,
    ) -> Result<(), Self::Error>;

    /// Convert object from ActivityPub type to database type.
    ///
    /// Called when an object is received from HTTP fetch or as part of an activity. This method
    /// should do verification and write the received object to database. Note that there is no
    /// distinction between create and update, so an `upsert` operation should be used.
    async fn from_json(json: Self::Kind, data: &Data<Self::DataType>) -> Result<Self, Self::Error>;
}

/// A collection of objects, e.g. a community's `followers` or `outbox`.
#[async_trait]
pub trait Collection: Sized {
    /// The type which owns this collection, e.g. a community for its followers collection.
    type Owner;
    /// App data type passed to handlers.
    type DataType: Clone + Send + Sync;
    /// The wire type which gets sent over the network.
    type Kind;
    /// Error type returned by handler methods
    type Error;

    /// Reads the local collection for `owner` and converts it to the federated type.
    async fn read_local(
        owner: &Self::Owner,
        data: &Data<Self::DataType>,
    ) -> Result<Self::Kind, Self::Error>;

    /// Verifies that the given wire collection is valid for `expected_domain`.
    async fn verify(
        json: &Self::Kind,
        expected_domain: &Url,
        data: &Data<Self::DataType>,
    ) -> Result<(), Self::Error>;

    /// Converts the wire collection into the local type, owned by `owner`.
    async fn from_json(
        json: Self::Kind,
        owner: &Self::Owner,
        data: &Data<Self::DataType>,
    ) -> Result<Self, Self::Error>;
}

/// Handler for receiving incoming activities.
///
/// ```
/// # use activitystreams_kinds::activity::FollowType;
/// # use url::Url;
/// # use fediverse_federation_core::fetch::object_id::ObjectId;
/// # use fediverse_federation_core::config::Data;
/// # use fediverse_federation_core::traits::ActivityHandler;
/// # use fediverse_federation_core::traits::tests::{DbConnection, DbUser};
/// #[derive(serde::Deserialize)]
/// struct Follow {
///     actor: ObjectId<DbUser>,
///     object: ObjectId<DbUser>,
///     #[serde(rename = "type")]
///     kind: FollowType,
///     id: Url,
/// }
///
/// #[async_trait::async_trait]
/// impl ActivityHandler for Follow {
///     type DataType = DbConnection;
///     type Error = anyhow::Error;
///
///     fn id(&self) -> &Url {
///         &self.id
///     }
///
///     fn actor(&self) -> &Url {
///         self.actor.inner()
///     }
///
///     async fn verify(&self, data: &Data<Self::DataType>) -> Result<(), Self::Error> {
///         Ok(())
///     }
///
///     async fn receive(self, data: &Data<Self::DataType>) -> Result<(), Self::Error> {
///         let local_user = self.object.dereference(data).await?;
///         let follower = self.actor.dereference(data).await?;
///         data.add_follower(local_user, follower).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ActivityHandler {
    /// App data type passed to handlers. Must be identical to
    /// [crate::config::FederationConfigBuilder::app_data] type.
    type DataType: Clone + Send + Sync;
    /// Error type returned by handler methods
    type Error;

    /// `id` field of the activity
    fn id(&self) -> &Url;

    /// `actor` field of activity
    fn actor(&self) -> &Url;

    /// Called before [ActivityHandler::receive]. Should perform fine-grained, activity-specific
    /// validation (beyond the generic host/domain/signature checks the inbox pipeline already
    /// performs) without mutating any state.
    async fn verify(&self, data: &Data<Self::DataType>) -> Result<(), Self::Error>;

    /// Called when an activity is received, after [ActivityHandler::verify] succeeded.
    ///
    /// Should perform the actual state mutation. In case the activity has a nested `object`
    /// field, must call the object's own handler. Implementations must be idempotent: this may
    /// be invoked more than once for the same activity `id`.
    async fn receive(self, data: &Data<Self::DataType>) -> Result<(), Self::Error>;
}

/// Trait to allow retrieving common Actor data.
pub trait Actor: Object + Send + 'static {
    /// The actor's public key for verifying signatures of incoming activities.
    fn public_key_pem(&self) -> &str;

    /// The actor's private key for signing outgoing activities, if held locally.
    fn private_key_pem(&self) -> Option<String>;

    /// The inbox where activities for this user should be sent to
    fn inbox(&self) -> Url;

    /// The actor's shared inbox, if any
    fn shared_inbox(&self) -> Option<Url> {
        None
    }

    /// Returns shared inbox if it exists, normal inbox otherwise.
    fn shared_inbox_or_inbox(&self) -> Url {
        self.shared_inbox().unwrap_or_else(|| self.inbox())
    }
}

/// Allow for boxing of enum variants
#[async_trait]
impl<T> ActivityHandler for Box<T>
where
    T: ActivityHandler + Send + Sync,
{
    type DataType = T::DataType;
    type Error = T::Error;

    fn id(&self) -> &Url {
        self.deref().id()
    }

    fn actor(&self) -> &Url {
        self.deref().actor()
    }

    async fn verify(&self, data: &Data<Self::DataType>) -> Result<(), Self::Error> {
        self.deref().verify(data).await
    }

    async fn receive(self, data: &Data<Self::DataType>) -> Result<(), Self::Error> {
        (*self).receive(data).await
    }
}

/// Some impls of these traits for use in tests. Dont use this from external crates.
///
/// TODO: Should be using `cfg[doctest]` but blocked by <https://github.com/rust-lang/rust/issues/67295>
#[doc(hidden)]
#[allow(clippy::unwrap_used)]
pub mod tests {
    use super::*;
    use crate::{
        fetch::object_id::ObjectId,
        http_signatures::{generate_actor_keypair, Keypair},
        protocol::public_key::PublicKey,
    };
    use activitystreams_kinds::{activity::FollowType, actor::PersonType};
    use anyhow::Error as AnyhowError;
    use once_cell::sync::Lazy;
    use serde::{Deserialize, Serialize};

    #[derive(Clone)]
    pub struct DbConnection;

    impl DbConnection {
        pub async fn read_user_from_apub_id<T>(&self, _: Url) -> Result<Option<T>, AnyhowError> {
            Ok(None)
        }
        pub async fn read_local_user(&self, _: String) -> Result<DbUser, AnyhowError> {
            Ok(DB_USER.clone())
        }
        pub async fn upsert<T>(&self, _: &T) -> Result<(), AnyhowError> {
            Ok(())
        }
        pub async fn add_follower(&self, _: DbUser, _: DbUser) -> Result<(), AnyhowError> {
            Ok(())
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Person {
        #[serde(rename = "type")]
        pub kind: PersonType,
        pub preferred_username: String,
        pub id: ObjectId<DbUser>,
        pub inbox: Url,
        pub public_key: PublicKey,
    }
    #[derive(Debug, Clone)]
    pub struct DbUser {
        pub name: String,
        pub apub_id: Url,
        pub inbox: Url,
        pub public_key: String,
        pub private_key: Option<String>,
        pub followers: Vec<Url>,
        pub local: bool,
    }

    pub static DB_USER_KEYPAIR: Lazy<Keypair> = Lazy::new(|| generate_actor_keypair().unwrap());

    pub static DB_USER: Lazy<DbUser> = Lazy::new(|| DbUser {
        name: String::new(),
        apub_id: "https://localhost/123".parse().unwrap(),
        inbox: "https://localhost/123/inbox".parse().unwrap(),
        public_key: DB_USER_KEYPAIR.public_key.clone(),
        private_key: Some(DB_USER_KEYPAIR.private_key.clone()),
        followers: vec![],
        local: false,
    });

    #[async_trait]
    impl Object for DbUser {
        type DataType = DbConnection;
        type Kind = Person;
        type Error = AnyhowError;

        async fn read_from_id(
            _object_id: Url,
            _data: &Data<Self::DataType>,
        ) -> Result<Option<Self>, Self::Error> {
            Ok(Some(DB_USER.clone()))
        }

        async fn into_json(self, _data: &Data<Self::DataType>) -> Result<Self::Kind, Self::Error> {
            let public_key = PublicKey::new(self.apub_id.clone(), self.public_key.clone());
            Ok(Person {
                preferred_username: self.name.clone(),
                kind: Default::default(),
                id: self.apub_id.into(),
                inbox: self.inbox,
                public_key,
            })
        }

        async fn verify(
            _json: &Self::Kind,
            _expected_domain: &Url,
            _data: &Data<Self::DataType>,
        ) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn from_json(
            json: Self::Kind,
            _data: &Data<Self::DataType>,
        ) -> Result<Self, Self::Error> {
            Ok(DbUser {
                name: json.preferred_username,
                apub_id: json.id.into(),
                inbox: json.inbox,
                public_key: json.public_key.public_key_pem,
                private_key: None,
                followers: vec![],
                local: false,
            })
        }
    }

    impl Actor for DbUser {
        fn public_key_pem(&self) -> &str {
            &self.public_key
        }

        fn private_key_pem(&self) -> Option<String> {
            self.private_key.clone()
        }

        fn inbox(&self) -> Url {
            self.inbox.clone()
        }
    }

    #[derive(Deserialize, Serialize, Clone, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Follow {
        pub actor: ObjectId<DbUser>,
        pub object: ObjectId<DbUser>,
        #[serde(rename = "type")]
        pub kind: FollowType,
        pub id: Url,
    }

    #[async_trait]
    impl ActivityHandler for Follow {
        type DataType = DbConnection;
        type Error = AnyhowError;

        fn id(&self) -> &Url {
            &self.id
        }

        fn actor(&self) -> &Url {
            self.actor.inner()
        }

        async fn verify(&self, _data: &Data<Self::DataType>) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn receive(self, _data: &Data<Self::DataType>) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Note {}
    #[derive(Debug, Clone)]
    pub struct DbPost {}

    #[async_trait]
    impl Object for DbPost {
        type DataType = DbConnection;
        type Kind = Note;
        type Error = AnyhowError;

        async fn read_from_id(
            _: Url,
            _: &Data<Self::DataType>,
        ) -> Result<Option<Self>, Self::Error> {
            Ok(None)
        }

        async fn into_json(self, _: &Data<Self::DataType>) -> Result<Self::Kind, Self::Error> {
            Ok(Note {})
        }

        async fn verify(
            _: &Self::Kind,
            _: &Url,
            _: &Data<Self::DataType>,
        ) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn from_json(_: Self::Kind, _: &Data<Self::DataType>) -> Result<Self, Self::Error> {
            Ok(DbPost {})
        }
    }
}
