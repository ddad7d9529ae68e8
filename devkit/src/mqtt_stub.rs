/*!
Mock MQTT Client pour développement sans broker

Enregistre tous les messages publiés pour assertions de tests.
*/

use crate::simulator::Publisher;
use anyhow::Result;
use rumqttc::QoS;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT Client qui simule rumqttc::AsyncClient côté publication
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simule la publication d'un message (compatible avec AsyncClient)
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };
        log::debug!("[mock] published to {}: {} bytes", message.topic, message.payload.len());
        lock(&self.published_messages).push(message);
        Ok(())
    }

    /// Récupère tous les messages publiés
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        lock(&self.published_messages).clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        lock(&self.published_messages)
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last_msg) => Ok(Some(serde_json::from_slice(&last_msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        lock(&self.published_messages).clear();
    }
}

impl Publisher for MockMqttClient {
    async fn send(&self, topic: String, payload: Vec<u8>) -> Result<()> {
        self.publish(topic, QoS::AtLeastOnce, false, payload).await
    }
}
