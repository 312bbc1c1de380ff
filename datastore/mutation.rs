use crate::error::{Error, Result};
use crate::layout::ModelTable;
use crate::plan::{QueryPlan, RequestContext};
use crate::sql_writer::SqlWriter;
use crate::value::SqlValue;
use quarry_schema::schema::Provider;
use std::sync::Arc;

/// A single built query handed to the low-level interceptor chain and then
/// to the executor. SELECT nodes carry the still-mutable plan so
/// interceptors (the policy engine among them) can rewrite it before SQL
/// emission.
pub enum QueryNode {
    Select(QueryPlan),
    Insert(InsertPlan),
    Update(UpdatePlan),
    Delete(DeletePlan),
}

impl QueryNode {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryNode::Select(_) => "select",
            QueryNode::Insert(_) => "insert",
            QueryNode::Update(_) => "update",
            QueryNode::Delete(_) => "delete",
        }
    }
}

/// Result of executing one query node.
#[derive(Debug)]
pub enum NodeOutput {
    Rows(Vec<crate::JsonObject>),
    Count(u64),
}

impl NodeOutput {
    pub fn into_rows(self) -> Result<Vec<crate::JsonObject>> {
        match self {
            NodeOutput::Rows(rows) => Ok(rows),
            NodeOutput::Count(_) => Err(Error::internal(anyhow::anyhow!(
                "expected rows, got an affected-row count"
            ))),
        }
    }

    pub fn into_count(self) -> Result<u64> {
        match self {
            NodeOutput::Count(count) => Ok(count),
            NodeOutput::Rows(_) => Err(Error::internal(anyhow::anyhow!(
                "expected an affected-row count, got rows"
            ))),
        }
    }
}

/// An INSERT of one or more rows into a single table.
pub struct InsertPlan {
    pub table: Arc<ModelTable>,
    /// Field names of the inserted columns; every row carries values in
    /// this order.
    pub fields: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// `createMany({ skipDuplicates: true })`.
    pub skip_duplicates: bool,
    /// Emit a RETURNING clause listing the inserted columns.
    pub returning: bool,
}

impl InsertPlan {
    pub fn build_sql(&self, provider: Provider) -> Result<(String, Vec<SqlValue>)> {
        let mut w = SqlWriter::new(provider);
        let mut args: Vec<SqlValue> = vec![];

        if self.skip_duplicates && provider == Provider::MySql {
            w.write_str("INSERT IGNORE INTO ");
        } else {
            w.write_str("INSERT INTO ");
        }
        w.write_str(&self.table.sql_reference(provider));
        w.write_str(" (");
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                w.write_str(", ");
            }
            let col = self.table.column(field).ok_or_else(|| {
                Error::internal(anyhow::anyhow!(
                    "no column for field `{}` on table `{}`",
                    field,
                    self.table.table_name.0
                ))
            })?;
            w.write_name(&col.col_name);
        }
        w.write_str(") VALUES ");
        for (row_idx, row) in self.rows.iter().enumerate() {
            if row_idx > 0 {
                w.write_str(", ");
            }
            w.write_str("(");
            for (i, value) in row.iter().enumerate() {
                if i > 0 {
                    w.write_str(", ");
                }
                if value.is_null() {
                    w.write_str("NULL");
                } else {
                    w.write_param(args.len());
                    args.push(value.clone());
                }
            }
            w.write_str(")");
        }
        if self.skip_duplicates && provider != Provider::MySql {
            w.write_str(" ON CONFLICT DO NOTHING");
        }
        if self.returning {
            if !provider.supports_returning() {
                return Err(Error::not_supported(anyhow::anyhow!(
                    "INSERT ... RETURNING is not available on this provider"
                )));
            }
            w.write_str(" RETURNING ");
            for (i, field) in self.fields.iter().enumerate() {
                if i > 0 {
                    w.write_str(", ");
                }
                let col = self.table.column(field).unwrap();
                w.write_name(&col.col_name);
            }
        }
        Ok((w.build(), args))
    }
}

/// How an UPDATE changes one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Set,
    Increment,
    Decrement,
    Multiply,
    Divide,
}

#[derive(Debug, Clone)]
pub struct SetItem {
    pub field: String,
    pub op: SetOp,
    pub value: SqlValue,
}

/// An UPDATE over the rows selected by `filter`.
pub struct UpdatePlan {
    pub table: Arc<ModelTable>,
    pub sets: Vec<SetItem>,
    /// Plan selecting the target rows; its id columns drive the WHERE.
    pub filter: QueryPlan,
    /// Bounds the number of affected rows (`updateMany` `limit`).
    pub limit: Option<u64>,
}

impl UpdatePlan {
    pub fn build_sql(&self, ctx: &RequestContext) -> Result<(String, Vec<SqlValue>)> {
        let provider = ctx.provider;
        let mut w = SqlWriter::new(provider);
        let mut args: Vec<SqlValue> = vec![];

        w.write_str("UPDATE ");
        w.write_str(&self.table.sql_reference(provider));
        w.write_str(" SET ");
        for (i, set) in self.sets.iter().enumerate() {
            if i > 0 {
                w.write_str(", ");
            }
            let col = self.table.column(&set.field).ok_or_else(|| {
                Error::internal(anyhow::anyhow!(
                    "no column for field `{}` on table `{}`",
                    set.field,
                    self.table.table_name.0
                ))
            })?;
            w.write_name(&col.col_name);
            w.write_str(" = ");
            match set.op {
                SetOp::Set => write_value(&mut w, &mut args, &set.value),
                SetOp::Increment | SetOp::Decrement | SetOp::Multiply | SetOp::Divide => {
                    w.write_name(&col.col_name);
                    w.write_str(match set.op {
                        SetOp::Increment => " + ",
                        SetOp::Decrement => " - ",
                        SetOp::Multiply => " * ",
                        SetOp::Divide => " / ",
                        SetOp::Set => unreachable!(),
                    });
                    write_value(&mut w, &mut args, &set.value);
                }
            }
        }
        write_target_filter(ctx, &mut w, &self.table, &self.filter, self.limit)?;
        Ok((w.build(), args))
    }
}

/// A DELETE over the rows selected by `filter`.
pub struct DeletePlan {
    pub table: Arc<ModelTable>,
    pub filter: QueryPlan,
    pub limit: Option<u64>,
}

impl DeletePlan {
    pub fn build_sql(&self, ctx: &RequestContext) -> Result<(String, Vec<SqlValue>)> {
        let mut w = SqlWriter::new(ctx.provider);
        w.write_str("DELETE FROM ");
        w.write_str(&self.table.sql_reference(ctx.provider));
        write_target_filter(ctx, &mut w, &self.table, &self.filter, self.limit)?;
        Ok((w.build(), vec![]))
    }
}

fn write_value(w: &mut SqlWriter, args: &mut Vec<SqlValue>, value: &SqlValue) {
    if value.is_null() {
        w.write_str("NULL");
    } else {
        w.write_param(args.len());
        args.push(value.clone());
    }
}

/// Appends `WHERE (<id cols>) IN (SELECT ... FROM (target plan))`.
///
/// The extra derived-table wrap the target plan already carries is what
/// makes this legal on MySQL, which otherwise refuses to reference the
/// updated table in a subquery.
fn write_target_filter(
    ctx: &RequestContext,
    w: &mut SqlWriter,
    table: &ModelTable,
    filter: &QueryPlan,
    limit: Option<u64>,
) -> Result<()> {
    let (mut id_select, _aliases) = filter.build_id_select(ctx)?;
    if let Some(limit) = limit {
        id_select = format!("{id_select} LIMIT {limit}");
    }
    w.write_str(" WHERE ");
    if table.id_fields.len() > 1 {
        w.write_str("(");
    }
    for (i, id_field) in table.id_fields.iter().enumerate() {
        if i > 0 {
            w.write_str(", ");
        }
        let col = table.column(id_field).ok_or_else(|| {
            Error::internal(anyhow::anyhow!(
                "id field `{id_field}` has no column on table `{}`",
                table.table_name.0
            ))
        })?;
        w.write_name(&col.col_name);
    }
    if table.id_fields.len() > 1 {
        w.write_str(")");
    }
    w.write_str(" IN (SELECT * FROM (");
    w.write_str(&id_select);
    w.write_str(") AS mutation_target)");
    Ok(())
}
