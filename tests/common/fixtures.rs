//! Payload builders shared by the integration tests.

use stoneforge::model::{
    Complexity, DocumentPayload, Element, PlanPayload, PlanStatus, Priority, TaskPayload,
    TaskStatus,
};
use stoneforge::{Payload, Workspace};

pub struct TaskBuilder {
    payload: TaskPayload,
}

impl TaskBuilder {
    pub fn new(title: &str) -> Self {
        Self {
            payload: TaskPayload::new(title),
        }
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.payload.status = status;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.payload.priority = Priority(priority);
        self
    }

    pub fn complexity(mut self, complexity: i32) -> Self {
        self.payload.complexity = Complexity(complexity);
        self
    }

    pub fn assignee(mut self, assignee: &str) -> Self {
        self.payload.assignee = Some(assignee.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.payload.description = description.to_string();
        self
    }

    pub fn build(self) -> Payload {
        Payload::Task(self.payload)
    }
}

pub fn task(title: &str) -> Payload {
    TaskBuilder::new(title).build()
}

pub fn plan(title: &str, status: PlanStatus) -> Payload {
    let mut payload = PlanPayload::new(title);
    payload.status = status;
    Payload::Plan(payload)
}

pub fn document(title: &str, body: &str) -> Payload {
    Payload::Document(DocumentPayload::new(title, body))
}

pub fn create(ws: &mut Workspace, payload: Payload) -> Element {
    ws.create_element(payload, "tester", &[]).expect("create element")
}

pub fn create_task(ws: &mut Workspace, title: &str) -> Element {
    create(ws, task(title))
}
